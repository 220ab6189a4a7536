#![cfg_attr(not(feature = "user"), no_std)]

mod record;

pub use record::*;
