pub mod config;
pub mod document;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod registrar;
pub mod transport;
pub mod window;

pub use document::Document;
pub use error::RegistrarError;
pub use limiter::{Admission, AdmissionController, LimiterSnapshot};
pub use registrar::DocumentRegistrar;
pub use transport::{HttpTransport, Transport, TransportError};
pub use window::RateLimit;
