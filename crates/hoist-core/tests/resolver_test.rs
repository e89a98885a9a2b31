use hoist_core::{
    DependencyKind, Error, ExcludeConfig, HoistConfig, PackageSource, Platform, Resolver,
    VersionConstraint,
};
use proptest::prelude::*;

// ── Platform support ──

#[test]
fn unknown_os_is_unsupported() {
    let err = Resolver::new().resolve("alpine", "3.19").unwrap_err();
    assert!(matches!(err, Error::UnsupportedPlatform { .. }));
}

#[test]
fn unknown_version_is_unsupported() {
    let err = Resolver::new().resolve("ubuntu", "14.04").unwrap_err();
    match err {
        Error::UnsupportedPlatform { requested, known } => {
            assert_eq!(requested, "ubuntu-14.04");
            assert!(known.contains(&"ubuntu-18.04".to_owned()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn system_packages_come_from_distribution() {
    let deps = Resolver::new().resolve("ubuntu", "18.04").unwrap();
    let gcc = deps.get("build-essential").unwrap();
    assert_eq!(gcc.kind, DependencyKind::System);
    assert_eq!(gcc.source, PackageSource::Distribution);
    assert_eq!(gcc.constraint, VersionConstraint::Latest);
}

// ── Pins ──

#[test]
fn pinned_python_on_old_ubuntu_uses_supplemental_source() {
    let deps = Resolver::new()
        .pin("python", "3.8")
        .resolve("ubuntu", "18.04")
        .unwrap();

    for name in ["python3.8", "python3.8-dev", "python3.8-venv"] {
        let dep = deps.get(name).unwrap_or_else(|| panic!("{name} missing"));
        assert_eq!(dep.source, PackageSource::Supplemental("deadsnakes".to_owned()));
    }
    // Never silently downgraded to the distribution default
    assert!(deps.get("python3.6").is_none());
    assert!(deps.sources().any(|(name, _)| name == "deadsnakes"));
}

#[test]
fn pin_beyond_every_source_is_a_conflict() {
    let err = Resolver::new()
        .pin("python", "3.12")
        .resolve("ubuntu", "18.04")
        .unwrap_err();

    match err {
        Error::VersionPinConflict {
            package,
            requested,
            platform,
            available,
        } => {
            assert_eq!(package, "python");
            assert_eq!(requested, "3.12");
            assert_eq!(platform, "ubuntu-18.04");
            assert_eq!(available, "3.6");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn pin_on_platform_without_sources_is_a_conflict() {
    let err = Resolver::new()
        .pin("python", "3.10")
        .resolve("debian", "11")
        .unwrap_err();
    assert!(err.to_string().contains("not available for debian-11"));
}

// ── Plugins and exclusions ──

#[test]
fn plugins_are_appended_with_own_constraints() {
    let deps = Resolver::new()
        .plugin("connector-a", "1.0")
        .plugin("connector-b", "")
        .resolve("ubuntu", "18.04")
        .unwrap();

    let a = deps.get("connector-a").unwrap();
    assert_eq!(a.kind, DependencyKind::Plugin);
    assert_eq!(a.source, PackageSource::PluginIndex);
    assert_eq!(a.constraint, VersionConstraint::Exact("1.0".to_owned()));
    assert_eq!(
        deps.get("connector-b").unwrap().constraint,
        VersionConstraint::Latest
    );
    assert_eq!(deps.of_kind(DependencyKind::Plugin).count(), 2);
}

#[test]
fn plugin_colliding_with_system_package_is_rejected() {
    let err = Resolver::new()
        .plugin("git", "1.0")
        .resolve("ubuntu", "18.04")
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateDependency { ref name } if name == "git"));
}

#[test]
fn platform_exclusions_are_recorded() {
    let deps = Resolver::new().resolve("ubuntu", "18.04").unwrap();
    let exclusion = deps.exclusion("libmariadbclient-dev").unwrap();
    assert!(exclusion.reason.contains("breaks the build"));
}

#[test]
fn config_exclusions_remove_entries() {
    let mut config = HoistConfig::default();
    config.plugins.insert("pydruid".to_owned(), "0.6.5".to_owned());
    config.exclude.push(ExcludeConfig {
        name: "pydruid".to_owned(),
        reason: "breaks the build".to_owned(),
    });

    let platform: Platform = config.platform.target.parse().unwrap();
    let deps = Resolver::from_config(&config)
        .resolve_platform(&platform)
        .unwrap();

    assert!(deps.get("pydruid").is_none());
    assert!(deps.is_excluded("pydruid"));
}

#[test]
fn default_config_resolves_on_default_platform() {
    let config = HoistConfig::default();
    let platform: Platform = config.platform.target.parse().unwrap();
    let deps = Resolver::from_config(&config)
        .resolve_platform(&platform)
        .unwrap();

    assert!(deps.get("python3.8").is_some());
    assert_eq!(
        deps.get("nodejs").unwrap().source,
        PackageSource::Supplemental("nodesource-14.x".to_owned())
    );
}

// ── Property-based tests ──

fn platform_id() -> impl Strategy<Value = (String, String)> {
    prop::sample::select(vec![
        ("ubuntu", "18.04"),
        ("ubuntu", "20.04"),
        ("ubuntu", "22.04"),
        ("debian", "11"),
        ("debian", "12"),
    ])
    .prop_map(|(os, v)| (os.to_owned(), v.to_owned()))
}

fn plugin_map() -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::vec(("connector-[a-z]{1,8}", "[0-9]\\.[0-9]{1,2}"), 0..5)
}

proptest! {
    #[test]
    fn resolve_is_deterministic(
        (os, version) in platform_id(),
        plugins in plugin_map(),
    ) {
        let mut resolver = Resolver::new().pin("nodejs", "10");
        for (name, v) in &plugins {
            resolver = resolver.plugin(name.clone(), v.clone());
        }
        let first = resolver.resolve(&os, &version);
        let second = resolver.resolve(&os, &version);
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            _ => prop_assert!(false, "resolution outcome differed between runs"),
        }
    }

    #[test]
    fn pinned_toolchain_never_below_pin(
        (os, version) in platform_id(),
        pin in prop::sample::select(vec!["3.6", "3.7", "3.8", "3.9", "3.10", "3.11", "3.12"]),
    ) {
        if let Ok(deps) = Resolver::new().pin("python", pin).resolve(&os, &version) {
            let selected: Vec<_> = deps
                .of_kind(DependencyKind::Toolchain)
                .filter_map(|(name, _)| name.strip_prefix("python"))
                .filter(|rest| !rest.contains('-'))
                .map(str::to_owned)
                .collect();
            prop_assert_eq!(selected.len(), 1);
            prop_assert_ne!(
                hoist_core::resolver::compare_versions(&selected[0], pin),
                std::cmp::Ordering::Less
            );
        }
    }
}
