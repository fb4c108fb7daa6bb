//! Fuzz target for the client engine's inbound path.
//!
//! Treats the input as everything a server sends and checks that the engine
//! never panics and reports at most one terminal event.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_engine -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use sluice_proto::ssh::auth::Credential;
use sluice_proto::ssh::config::ClientConfig;
use sluice_proto::ssh::engine::{Engine, Event};

fuzz_target!(|data: &[u8]| {
    let config = ClientConfig::new("fuzz", Credential::password("fuzz"));
    let mut engine = Engine::new(config).expect("Default config is valid");
    engine.start();

    let mut terminal = 0;
    for chunk in data.chunks(97) {
        for event in engine.receive(chunk) {
            if matches!(event, Event::Closed | Event::Failed(_)) {
                terminal += 1;
            }
        }
        let _ = engine.take_outbound();
    }
    for event in engine.transport_closed(None) {
        if matches!(event, Event::Closed | Event::Failed(_)) {
            terminal += 1;
        }
    }
    assert!(terminal <= 1);
});
