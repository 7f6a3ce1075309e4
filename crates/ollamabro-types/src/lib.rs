mod chat;
mod enrichment;
mod stream;

pub use chat::*;
pub use enrichment::*;
pub use stream::*;
