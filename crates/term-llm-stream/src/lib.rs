mod inline;
mod parser;

pub use inline::{InlineApplyError, InlineEdit, InlineParser, InlineSink};
pub use parser::{FileEdit, StreamParser, StreamSink};
