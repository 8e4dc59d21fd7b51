#![no_main]

use libfuzzer_sys::fuzz_target;

use cachegate::cache::{AcceptedEncodings, NO_ENCODING, VariantResolver, split_variant_key};

fuzz_target!(|data: &[u8]| {
    let header = String::from_utf8_lossy(data);
    let accepted = AcceptedEncodings::parse(header.as_ref());
    let _ = accepted.accepts("gzip");

    let resolver = VariantResolver::default();
    let url = "http://fuzz.example/page.html";
    let keys = resolver.candidates(Some(header.as_ref()), url);
    assert!(!keys.is_empty());
    for key in &keys {
        let (_, rest) = split_variant_key(key).expect("candidate keys always split");
        assert_eq!(rest, url);
    }
    let last = keys.last().expect("identity candidate");
    assert_eq!(split_variant_key(last).map(|(enc, _)| enc), Some(NO_ENCODING));
});
