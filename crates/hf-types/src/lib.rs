pub mod errors;
pub mod evaluation;
pub mod position;
pub mod space;

pub use errors::*;
pub use evaluation::*;
pub use position::*;
pub use space::*;
