//! Cross-module tests: lifecycle scenarios, invariants under random
//! operation sequences, and concurrent stress.

pub(crate) mod helpers;
mod property;
mod stress;

/// Knobs shared by the stress tests.
pub(crate) struct TestConfig {
    pub stress_thread_count: usize,
    pub stress_iterations: usize,
}

pub(crate) static TEST_CONFIG: spin::Mutex<TestConfig> = spin::Mutex::new(TestConfig {
    stress_thread_count: 16,
    stress_iterations: 200,
});
