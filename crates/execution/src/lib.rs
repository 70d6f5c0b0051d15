//! Pull-based step-vector operators for the FMQ engine.
//!
//! Architecture role:
//! - defines the operator contract and pooled step-vector batches
//! - implements the vector/matrix selector operators over series storage
//! - implements remote-execution leaves and result deduplication
//!
//! Key modules:
//! - [`model`] (operator trait, [`model::StepVector`], [`model::VectorPool`])
//! - [`scan`] (selector operators)
//! - [`functions`] (range functions applied by the matrix selector)
//! - [`stream`] (step-vector streams for remote results)
//! - [`remote`] (remote engine seam, remote leaf, deduplication)

pub mod functions;
pub mod model;
pub mod remote;
pub mod scan;
pub mod stream;

pub use functions::{new_range_function, FunctionArgs, RangeFunctionCall};
pub use model::{check_cancelled, explain_operator, StepVector, VectorOperator, VectorPool};
pub use remote::{Deduplicate, RemoteEngine, RemoteExec};
pub use scan::{MatrixSelector, VectorSelector};
pub use stream::{
    bounded_batch_channel, empty_stream, BatchSender, SendableStepVectorStream, StepVectorStream,
    StreamAdapter,
};
