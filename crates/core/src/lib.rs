pub mod config;
pub mod error;

pub use config::{load_dotenv, ThrottleConfig};
pub use error::*;
