//! Serialized snapshot shapes for saving and restoring graph state.

pub mod serialization;

pub use serialization::{
    SerializedConstraint, SerializedGrid, SerializedNode, SerializedSubmap,
};
