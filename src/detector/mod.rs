pub mod classifier;
pub mod dedup;
pub mod format;
pub mod scan;
pub mod value;

pub use dedup::ValueDetector;
pub use scan::AlertScanner;
