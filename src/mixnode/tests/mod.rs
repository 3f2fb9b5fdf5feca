//! Scenario-level test suites
//!
//! Per-module unit tests live next to their code; these cover the
//! cross-component behaviors: multi-hop Sphinx laws, delay statistics,
//! lottery statistics, version gating and full pipeline runs.

mod test_delay_statistics;
mod test_sphinx_roundtrip;
