pub mod act;
pub mod config;
pub mod error;
pub mod event;
pub mod generation;
pub mod stream;
pub mod types;

pub use act::{Act, ActError, ActStatus, ActSummary};
pub use config::AppConfig;
pub use error::{CapabilityError, GenerationError, GraphValidationError, Result, TesseraError};
pub use event::EventBus;
pub use generation::{Generation, GenerationOrigin, GenerationStatus};
pub use stream::{OutputBuffer, OutputChunk, OutputReader, OutputSink};
pub use types::*;
