#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use datacat::privilege::{
    ConfigurationError, IpRangeConfig, PrivilegeConfig, PrivilegeResolver, PrivilegeSetConfig,
};

fn parse(toml_text: &str) -> PrivilegeConfig {
    toml::from_str(toml_text).unwrap()
}

fn resolver(toml_text: &str) -> PrivilegeResolver {
    PrivilegeResolver::from_config(&parse(toml_text)).unwrap()
}

#[test]
fn longest_match_decides() {
    let r = resolver(
        r#"
        default = "public"
        [[sets]]
        name = "public"
        rules = [{ allow = "/" }, { deny = "/secret" }, { allow = "/secret/public" }]
        "#,
    );
    let set = r.default_set();
    assert!(set.allows("/data/x"));
    assert!(!set.allows("/secret/x"));
    assert!(set.allows("/secret/public/y"));
}

#[test]
fn no_rules_allows_everything() {
    let r = resolver("");
    let set = r.resolve("127.0.0.1");
    assert_eq!(set.name(), "default");
    assert!(set.allows("/anything"));
}

#[test]
fn deny_without_allow_denies() {
    let r = resolver(
        r#"
        [[sets]]
        name = "default"
        rules = [{ deny = "/private" }]
        "#,
    );
    let set = r.default_set();
    assert!(!set.allows("/private/data"));
    assert!(set.allows("/public/data"));
}

#[test]
fn child_overrides_parent() {
    let r = resolver(
        r#"
        [[sets]]
        name = "public"
        rules = [{ deny = "/restricted" }]

        [[sets]]
        name = "staff"
        inherit = "public"
        rules = [{ allow = "/restricted/reports" }]
        "#,
    );
    let public = r.set("public").unwrap();
    let staff = r.set("staff").unwrap();
    assert!(!public.allows("/restricted/reports/2024"));
    assert!(staff.allows("/restricted/reports/2024"));
    assert!(!staff.allows("/restricted/raw"), "inherited deny still applies");
    assert_eq!(staff.parent().unwrap().name(), "public");
}

#[test]
fn equal_length_tie_goes_to_later_rule() {
    let r = resolver(
        r#"
        [[sets]]
        name = "allow-last"
        rules = [{ deny = "/a" }, { allow = "/a" }]

        [[sets]]
        name = "deny-last"
        rules = [{ allow = "/a" }, { deny = "/a" }]
        "#,
    );
    assert!(r.set("allow-last").unwrap().allows("/a/x"));
    assert!(!r.set("deny-last").unwrap().allows("/a/x"));
}

#[test]
fn equal_length_tie_goes_to_nearer_set() {
    // The child is declared first, so its rule has the lower sequence number; nearness still
    // wins over declaration order across sets.
    let r = resolver(
        r#"
        [[sets]]
        name = "child"
        inherit = "parent"
        rules = [{ deny = "/a" }]

        [[sets]]
        name = "parent"
        rules = [{ allow = "/a" }]

        [[sets]]
        name = "open-child"
        inherit = "closed-parent"
        rules = [{ allow = "/a" }]

        [[sets]]
        name = "closed-parent"
        rules = [{ deny = "/a" }]
        "#,
    );
    assert!(!r.set("child").unwrap().allows("/a"));
    assert!(r.set("parent").unwrap().allows("/a"));
    assert!(r.set("open-child").unwrap().allows("/a"));
}

#[test]
fn ever_allows_sees_allowed_subpaths() {
    let r = resolver(
        r#"
        [[sets]]
        name = "default"
        rules = [{ deny = "/" }, { allow = "/x/y" }]
        "#,
    );
    let set = r.default_set();
    assert!(!set.allows("/x"));
    assert!(set.ever_allows("/x"));
    assert!(set.ever_allows("/x/y/z"));
    assert!(!set.ever_allows("/z"));
}

#[test]
fn attributes_fall_back_to_parent_then_default() {
    let r = resolver(
        r#"
        [[sets]]
        name = "base"
        attributes = { max-response-mb = 100, compress = "yes", label = "base" }

        [[sets]]
        name = "power"
        inherit = "base"
        attributes = { max-response-mb = 2000, compress = false }
        "#,
    );
    let power = r.set("power").unwrap();
    assert_eq!(power.num_attribute("max-response-mb", 1), 2000);
    assert!(!power.flag("compress", true));
    assert_eq!(power.attribute("label", "none"), "base");
    assert_eq!(power.attribute("missing", "none"), "none");

    let base = r.set("base").unwrap();
    assert!(base.flag("compress", false));
    assert_eq!(base.num_attribute("label", 7), 7, "non-numeric falls back to default");
}

#[test]
fn address_resolution_uses_longest_prefix() {
    let r = resolver(
        r#"
        default = "outside"
        [[sets]]
        name = "outside"
        [[sets]]
        name = "campus"
        [[sets]]
        name = "lab"

        [[ip-ranges]]
        mask = "10."
        privilege = "campus"

        [[ip-ranges]]
        mask = "10.1."
        privilege = "lab"
        "#,
    );
    assert_eq!(r.resolve("10.1.2.3").name(), "lab");
    assert_eq!(r.resolve("10.5.0.1").name(), "campus");
    assert_eq!(r.resolve("192.168.0.1").name(), "outside");
}

#[test]
fn short_mask_does_not_match_longer_octet() {
    let r = resolver(
        r#"
        [[sets]]
        name = "lab"

        [[ip-ranges]]
        mask = "10.1"
        privilege = "lab"
        "#,
    );
    assert_eq!(r.resolve("10.1.0.7").name(), "lab");
    assert_eq!(r.resolve("10.15.0.7").name(), "default");
}

#[test]
fn bad_ranges_are_skipped() {
    let mut config = parse(
        r#"
        [[sets]]
        name = "lab"
        "#,
    );
    config.ip_ranges = vec![
        IpRangeConfig {
            mask: String::new(),
            privilege: "lab".to_owned(),
        },
        IpRangeConfig {
            mask: "10.".to_owned(),
            privilege: String::new(),
        },
        IpRangeConfig {
            mask: "10.2.".to_owned(),
            privilege: "nobody".to_owned(),
        },
        IpRangeConfig {
            mask: "10.3.".to_owned(),
            privilege: "lab".to_owned(),
        },
    ];
    let r = PrivilegeResolver::from_config(&config).unwrap();
    assert_eq!(r.resolve("10.2.0.1").name(), "default");
    assert_eq!(r.resolve("10.3.0.1").name(), "lab");
}

#[test]
fn invalid_configurations_are_rejected() {
    let cycle = parse(
        r#"
        [[sets]]
        name = "a"
        inherit = "b"
        [[sets]]
        name = "b"
        inherit = "a"
        "#,
    );
    assert!(matches!(
        PrivilegeResolver::from_config(&cycle),
        Err(ConfigurationError::Cycle(_))
    ));

    let unknown_parent = PrivilegeConfig {
        sets: vec![PrivilegeSetConfig {
            name: "a".to_owned(),
            inherit: Some("ghost".to_owned()),
            ..PrivilegeSetConfig::default()
        }],
        ..PrivilegeConfig::default()
    };
    assert_eq!(
        PrivilegeResolver::from_config(&unknown_parent).unwrap_err(),
        ConfigurationError::UnknownParent {
            set: "a".to_owned(),
            parent: "ghost".to_owned(),
        }
    );

    let unknown_default = PrivilegeConfig {
        default: Some("ghost".to_owned()),
        ..PrivilegeConfig::default()
    };
    assert_eq!(
        PrivilegeResolver::from_config(&unknown_default).unwrap_err(),
        ConfigurationError::UnknownDefault("ghost".to_owned())
    );
}
