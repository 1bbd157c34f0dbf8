pub mod youtube;

pub use youtube::{normalize_query, YtDlpConfig, YtDlpSource};
