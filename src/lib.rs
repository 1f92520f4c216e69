//! Host package for the workspace-level integration tests, benchmarks and demos.
