use std::sync::Arc;

use hostlink::diagnostics::{classify, CollectingSink, DiagnosticClassifier, Disposition};

#[test]
fn documented_examples() {
    let cases = [
        ("x.c:3: warning: implicit declaration of function 'foo'", Disposition::Suppressed),
        ("x.c:7: warning: assignment discards qualifiers", Disposition::Warning),
        ("x.c:1: include file 'stdio.h' not found", Disposition::Warning),
        ("'main' defined twice", Disposition::Warning),
        ("tcc: error: undefined symbol 'sqrtl'", Disposition::Warning),
        ("x.c:9: error: ';' expected (got \"}\")", Disposition::Error),
        ("include file", Disposition::Error),
    ];
    for (message, expected) in cases {
        assert_eq!(classify(message), expected, "{message}");
    }
}

#[test]
fn classifier_forwards_and_counts() {
    let sink = Arc::new(CollectingSink::new());
    let classifier = DiagnosticClassifier::new(sink.clone());
    let callback = classifier.callback();

    callback("a.c:1: warning: implicit declaration of function 'f'");
    callback("a.c:2: warning: unused variable 'x'");
    callback("a.c:3: error: lvalue expected");

    let counts = classifier.counts();
    assert_eq!((counts.suppressed, counts.warnings, counts.errors), (1, 1, 1));
    assert_eq!(sink.warnings(), vec!["a.c:2: warning: unused variable 'x'".to_string()]);
    assert_eq!(sink.errors(), vec!["a.c:3: error: lvalue expected".to_string()]);
    assert_eq!(sink.events().len(), 2);
}

#[test]
fn clones_share_counters() {
    let classifier = DiagnosticClassifier::new(Arc::new(CollectingSink::new()));
    let clone = classifier.clone();
    clone.on_message("boom");
    assert_eq!(classifier.counts().errors, 1);
}
