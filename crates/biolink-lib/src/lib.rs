pub mod assemble;
pub mod channels;
pub mod device;
pub mod io;
pub mod signal;

pub use channels::*;
pub use signal::*;
