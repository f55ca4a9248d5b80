pub mod automation;
pub mod controller;
pub mod events;
pub mod queue;
pub mod shared;

#[cfg(test)]
pub(crate) mod test_support;
