//! Cross-format contract tests: compile, export, import, and match
//! behavior over the documented scenarios.

use containerv_common::{PERM_EXEC, PERM_READ, PERM_WRITE};
use protecc::{
    compile, Action, CompileConfig, CompileFlags, CompileMode, Family, NetworkProfile,
    NetworkQuery, NetworkRule, PathProfile, PathRule, Protocol,
};

fn compile_mode(rules: &[PathRule], mode: CompileMode) -> PathProfile {
    compile(rules, CompileFlags::default(), mode, &CompileConfig::default()).unwrap()
}

#[test]
fn tty_charset_scenario() {
    for mode in [CompileMode::Trie, CompileMode::Dfa] {
        let profile = compile_mode(
            &[PathRule::new("/dev/tty[0-9]+", PERM_READ | PERM_WRITE)],
            mode,
        );
        assert!(profile.matches("/dev/tty0", PERM_READ));
        assert!(profile.matches("/dev/tty123", PERM_READ));
        assert!(!profile.matches("/dev/tty", PERM_READ));
        assert!(!profile.matches("/dev/ttya", PERM_READ));
    }
}

#[test]
fn recursive_log_scenario() {
    for mode in [CompileMode::Trie, CompileMode::Dfa] {
        let profile = compile_mode(&[PathRule::new("/var/log/**/*.log", PERM_READ)], mode);
        assert!(profile.matches("/var/log/app.log", PERM_READ));
        assert!(profile.matches("/var/log/sub/dir/app.log", PERM_READ));
        assert!(!profile.matches("/var/log/sub/app.txt", PERM_READ));
    }
}

#[test]
fn case_insensitive_scenario() {
    let profile = compile(
        &[PathRule::new("/tmp/File", PERM_READ)],
        CompileFlags {
            case_insensitive: true,
            ..Default::default()
        },
        CompileMode::Trie,
        &CompileConfig::default(),
    )
    .unwrap();
    assert!(profile.matches("/tmp/FILE", PERM_READ));
    assert!(profile.matches("/tmp/file", PERM_READ));
}

#[test]
fn import_export_identity_preserves_matches() {
    let rules = [
        PathRule::new("/usr/bin/**", PERM_READ | PERM_EXEC),
        PathRule::new("/etc/*.conf", PERM_READ),
        PathRule::new("/dev/tty[0-9]+", PERM_READ | PERM_WRITE),
        PathRule::new("/home/*/.config/**", PERM_READ | PERM_WRITE),
    ];
    let probes = [
        "/usr/bin/true",
        "/usr/bin/a/b",
        "/etc/chef.conf",
        "/etc/sub/chef.conf",
        "/dev/tty9",
        "/home/alice/.config/app/settings",
        "/home/alice/other",
        "/",
        "",
    ];
    for mode in [CompileMode::Trie, CompileMode::Dfa] {
        let profile = compile_mode(&rules, mode);
        let back = PathProfile::from_bytes(&profile.to_bytes()).unwrap();
        for probe in probes {
            for required in [0, PERM_READ, PERM_WRITE, PERM_READ | PERM_EXEC] {
                assert_eq!(
                    profile.matches(probe, required),
                    back.matches(probe, required),
                    "probe {probe:?} required {required:#x}"
                );
            }
        }
    }
}

#[test]
fn web_tuple_scenario() {
    let profile = NetworkProfile::new(
        vec![NetworkRule {
            action: Action::Allow,
            protocol: Some(Protocol::Tcp),
            family: Some(Family::Inet),
            port_from: 80,
            port_to: 443,
            ip_pattern: Some("10.*.*.*".to_string()),
            unix_pattern: None,
        }],
        0,
    )
    .unwrap();
    let profile = NetworkProfile::from_bytes(&profile.to_bytes()).unwrap();

    let hit = |protocol, port, address| {
        profile.evaluate(&NetworkQuery {
            protocol,
            family: Family::Inet,
            port,
            address,
        })
    };
    assert_eq!(hit(Protocol::Tcp, 443, "10.0.0.1"), Some(Action::Allow));
    assert_eq!(hit(Protocol::Udp, 443, "10.0.0.1"), None);
    assert_eq!(hit(Protocol::Tcp, 80, "192.168.0.1"), None);
}
