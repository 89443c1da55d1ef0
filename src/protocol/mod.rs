//! Engine wire protocol: NDJSON framing, typed messages, and outbound frames.
//!
//! - `codec`: line framing shared by the pure [`codec::decode_frames`] helper
//!   and the [`codec::NdjsonCodec`] used by the inbound pump.
//! - `message`: the closed [`message::Message`] set.
//! - `resolver`: JSON object → [`message::Message`] with typed errors.
//! - `outbound`: user turns and control frames written to the engine.

pub mod codec;
pub mod message;
pub mod outbound;
pub mod resolver;

pub use message::{ContentBlock, DeltaFragment, Message, ResultMessage, ResultStatus};
pub use outbound::{ControlRequestBody, QueryPayload, UserContent};
