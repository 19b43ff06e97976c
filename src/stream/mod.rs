pub mod parser;
pub mod translate;

pub use parser::{Frame, LineFramer, ProviderStreamParser, UpstreamItem, DONE_SENTINEL};
pub use translate::{apply, reframe, Flow, Outbound};
