use klarista::ErrorKind;
use klarista::envfile::{EnvResolver, default_environment_file};

fn position(rendered: &str, name: &str) -> usize {
    rendered
        .lines()
        .position(|l| l.starts_with(&format!("export {name}=")))
        .unwrap_or_else(|| panic!("{name} missing from:\n{rendered}"))
}

#[test]
fn references_are_assigned_first() {
    let env = EnvResolver::new(|_: &str| None)
        .resolve([
            ("C", "${B}-z".to_string()),
            ("A", "x".to_string()),
            ("B", "${A}-y".to_string()),
        ])
        .expect("resolve");
    let rendered = env.render();
    assert!(position(&rendered, "A") < position(&rendered, "B"));
    assert!(position(&rendered, "B") < position(&rendered, "C"));
    assert_eq!(rendered.lines().count(), 8);
}

#[test]
fn mutual_references_fail() {
    let err = EnvResolver::new(|_: &str| None)
        .resolve([("A", "${B}"), ("B", "${A}")])
        .expect_err("cycle");
    assert_eq!(err.kind(), ErrorKind::ConfigCycle);
}

#[test]
fn default_file_uses_ambient_profile() {
    let rendered = default_environment_file("k8s.example.com", |name: &str| match name {
        "AWS_PROFILE" => Some("ops".into()),
        "AWS_REGION" => Some("us-east-1".into()),
        _ => None,
    })
    .expect("render");
    assert!(rendered.contains("export AWS_PROFILE=\"ops\""));
    assert!(rendered.contains("export AWS_REGION=\"us-east-1\""));
    assert!(
        position(&rendered, "KLARISTA_LOCAL_STATE_DIR") < position(&rendered, "KUBECONFIG")
    );
}
