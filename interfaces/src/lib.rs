pub mod defs;

pub use defs::{Account, AccountRegistry, Post, PostKind, PostSource};
