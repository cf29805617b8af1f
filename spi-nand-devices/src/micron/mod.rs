mod mt29f;

pub use mt29f::*;
