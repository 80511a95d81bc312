mod py_detection;
mod py_track;
mod py_tracker;

pub use py_detection::PyDetection;
pub use py_track::PyTrack;
pub use py_tracker::PyTracker;
