//! Integration tests for `mq-dispatch`. The tests live under `tests/`.
