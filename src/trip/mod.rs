pub mod machine;
pub mod merge;

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests;

pub use machine::{StartOutcome, TripStateMachine};
