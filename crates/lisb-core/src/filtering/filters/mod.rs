//! Concrete filters

pub mod blacklist;
pub mod classifier;
pub mod dkim;
pub mod from;
pub mod return_path;
pub mod spf;
pub mod to;
pub mod xheaders;

pub use blacklist::{load_drop_list, parse_drop_list, BlacklistEntry, BlacklistFilter};
pub use classifier::{ClassifierFilter, FeatureExtractor, LinearModel, Model, FEATURE_COUNT};
pub use dkim::{DkimFilter, DkimRecord};
pub use from::FromFilter;
pub use return_path::ReturnPathFilter;
pub use spf::SpfFilter;
pub use to::ToFilter;
pub use xheaders::XHeaderFilter;
