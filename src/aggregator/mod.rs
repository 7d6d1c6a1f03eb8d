/// Rolling storage of recent samples
pub mod sample_history;

pub use sample_history::SampleHistory;
