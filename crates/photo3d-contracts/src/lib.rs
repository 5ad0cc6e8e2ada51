//! Data model and pure algorithms shared by the photo-to-3D engine.

pub mod errors;
pub mod events;
pub mod palette;
pub mod printability;
pub mod prompts;
pub mod providers;
pub mod tasks;
pub mod views;

pub use errors::{GenerationError, GenerationResult};
