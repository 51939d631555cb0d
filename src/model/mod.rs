//! Core data types shared by the gateway and its collaborators.

mod annotations;
mod labels;
mod matcher;
mod time;
mod value;

pub use annotations::*;
pub use labels::*;
pub use matcher::*;
pub use time::*;
pub use value::*;
