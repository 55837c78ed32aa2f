//! ONNX Runtime sessions and structural checks for exported ONNX graphs.
//!
//! Two independent views of one `.onnx` artifact:
//!
//! - [`checker`] decodes the protobuf itself and checks the graph against
//!   the schema (opsets, producers, element types, external data).
//! - [`Env`] / [`Session`] load the same file into ONNX Runtime and run it.
//!
//! # Usage
//!
//! ```no_run
//! use speechport_onnx::{check_model_file, Env, Tensor};
//!
//! let summary = check_model_file("models/wav2vec2_encoder.onnx").unwrap();
//! assert_eq!(summary.opset_version, 14);
//!
//! let env = Env::new("speechport").unwrap();
//! let mut session = env.open_session("models/wav2vec2_encoder.onnx").unwrap();
//! let input = Tensor::new(&[1, 16000], &vec![0.0; 16000]).unwrap();
//! let outputs = session.run(&["audio"], &[&input], &["last_hidden_state"]).unwrap();
//! assert_eq!(outputs[0].shape().len(), 3);
//! ```
//!
//! # Linking
//!
//! ONNX Runtime comes from the `ort` crate's prebuilt binaries.

pub mod checker;
mod error;
mod onnx;
pub mod proto;

pub use checker::{check_model, check_model_file, Dim, ModelSummary, ValueSummary};
pub use error::OnnxError;
pub use onnx::{ElementType, Env, IoSpec, Session, Tensor};
