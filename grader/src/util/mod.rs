pub mod fs;
mod deserialize;
pub mod names;
pub mod path_security;
pub mod tar;

pub use deserialize::*;
