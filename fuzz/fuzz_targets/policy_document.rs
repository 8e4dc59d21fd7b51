#![no_main]

use libfuzzer_sys::fuzz_target;

use cachegate::policy::{CachePolicy, compile_policy_text};
use cachegate::request::RequestInfo;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(policy) = compile_policy_text(text) else {
        return;
    };
    for url in ["http://example.com/", "http://example.com/a.html", ""] {
        let ttl = policy
            .decide_request(&RequestInfo::get(url))
            .expect("compiled policies evaluate");
        assert!(ttl >= 0);
    }
});
