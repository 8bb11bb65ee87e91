//! SMTP ingress

mod handler;
mod server;

pub use handler::{SmtpHandler, REJECTION_REPLY, SHUTDOWN_REPLY};
pub use server::SmtpServer;
