pub mod backoff;
pub mod error;
pub mod hw;
pub mod io;
pub mod observability;
pub mod output;
pub mod pipeline;
pub mod recipe;
pub mod runner;
pub mod scheduler;
pub mod soft;
pub mod stages;
pub mod surface;
pub mod timestamp;
pub mod validation;

pub use error::{PipelineError, SendStatus};
pub use pipeline::{Pipeline, StageRegistry, build_pipeline};
pub use recipe::Recipe;
