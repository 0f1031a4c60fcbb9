pub mod attention;
pub mod backbone;
pub mod decoding;
pub mod dynamics;
pub mod loss;
pub mod masking;
pub mod norm;
pub mod positional;
pub mod quantizer;
pub mod schedule;

pub use backbone::{align_conditioning, SequenceTransformer, SpatioTemporalTransformer};
pub use decoding::{DecodeOptions, DecodeOutput};
pub use dynamics::{DynamicsModel, ForwardOutput};
pub use loss::{masked_accuracy, masked_cross_entropy};
pub use masking::{apply_mask, MaskState, MaskingPolicy};
pub use positional::spatial_positional_encoding;
pub use quantizer::{FiniteScalarQuantizer, IndexToLatents};
pub use schedule::{exp_schedule, DEFAULT_SCHEDULE_K};
