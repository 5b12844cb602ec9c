mod braces;
mod levenshtein;
mod matcher;
mod unified;

pub use braces::brace_delta;
pub use levenshtein::line_similarity;
pub use matcher::{
    ELISION_MARKER, ELISION_TOKEN, LineGuard, MatchError, MatchLevel, MatchResult, find_match,
};
pub use unified::{
    ApplyReport, DiffError, FileDiff, Hunk, HunkLine, HunkLineKind, apply, apply_with_warnings,
    filter_stream_blanks, parse_file_diff, parse_patch_path, parse_unified_diff,
};
