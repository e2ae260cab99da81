// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use fault_tracking::partial_unmap::PartialUnmapConfig;

#[test_log::test]
fn partial_unmap_is_configured_once() {
    assert!(fault_tracking::configure_partial_unmap(PartialUnmapConfig {
        max_threads: 1,
        ..PartialUnmapConfig::default()
    }));
    assert!(!fault_tracking::configure_partial_unmap(
        PartialUnmapConfig::default()
    ));

    let state = fault_tracking::partial_unmap_state();
    drop(state.begin_remap());
    assert!(state.retry_from_access_violation());

    // the table was sized by the first configuration, so a second thread finds no slot
    let retried = std::thread::spawn(|| {
        fault_tracking::partial_unmap_state().retry_from_access_violation()
    })
    .join()
    .unwrap();
    assert!(!retried);
    assert_eq!(state.registered_threads(), 1);
}
