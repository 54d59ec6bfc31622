use std::cmp::Ordering;

use super::*;

#[test]
fn compare_versions_orders_numeric_runs_numerically() {
    assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
    assert_eq!(compare_versions("1.10.0", "1.2.0"), Ordering::Greater);
    assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
}

#[test]
fn compare_versions_shorter_equal_prefix_is_less() {
    assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Less);
    assert_eq!(compare_versions("1.0.0", "1.0"), Ordering::Greater);
}

#[test]
fn compare_versions_compares_non_digits_lexically() {
    assert_eq!(compare_versions("abc", "abd"), Ordering::Less);
    assert_eq!(compare_versions("1.0-beta", "1.0-rc"), Ordering::Less);
}

#[test]
fn compare_versions_equal_inputs() {
    assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    assert_eq!(compare_versions("", ""), Ordering::Equal);
}

#[test]
fn compare_versions_ignores_leading_zeros_in_runs() {
    assert_eq!(compare_versions("1.02.0", "1.2.0"), Ordering::Equal);
    assert_eq!(compare_versions("1.010", "1.9"), Ordering::Greater);
}

#[test]
fn validate_dns_name_accepts_reverse_dns_ids() {
    assert!(validate_dns_name("com.example.app", 3));
    assert!(validate_dns_name("io.dev-board.nav2", 2));
    assert!(validate_dns_name("localhost", 1));
}

#[test]
fn validate_dns_name_rejects_uppercase() {
    assert!(!validate_dns_name("Com.Example", 2));
}

#[test]
fn validate_dns_name_rejects_empty_parts_and_short_names() {
    assert!(!validate_dns_name("a..b", 2));
    assert!(!validate_dns_name("onlyone", 2));
    assert!(!validate_dns_name("", 1));
}

#[test]
fn validate_dns_name_rejects_misplaced_dashes_and_long_parts() {
    assert!(!validate_dns_name("com.-example", 2));
    assert!(!validate_dns_name("com.example-", 2));
    let long_part = "a".repeat(64);
    assert!(!validate_dns_name(&format!("com.{long_part}"), 2));
}

#[test]
fn application_id_validation() {
    assert!(is_valid_application_id("com.example.app").is_ok());

    let err = is_valid_application_id("").expect_err("empty id must fail");
    assert!(err.contains("must not be empty"));

    let err = is_valid_application_id("bad/id").expect_err("slash must fail");
    assert!(err.contains("printable ASCII"));

    let err = is_valid_application_id("   ").expect_err("whitespace-only must fail");
    assert!(err.contains("white-space"));

    let err =
        is_valid_application_id(&"x".repeat(151)).expect_err("over-long id must fail");
    assert!(err.contains("maximum length"));
}

#[test]
fn package_header_parses_and_validates() {
    let raw = r#"
application_id = "com.example.nav"
version = "1.2.0"
content_sha256 = "ab12"
capabilities = ["location"]

[names]
en = "Navigation"

[extra]
vendor = "example"
"#;
    let header = PackageHeader::from_toml_str(raw).expect("must parse header");
    assert_eq!(header.application_id, "com.example.nav");
    assert_eq!(header.display_name(), "Navigation");
    assert_eq!(header.capabilities, vec!["location"]);
    assert_eq!(header.extra.get("vendor").map(String::as_str), Some("example"));
}

#[test]
fn package_header_rejects_invalid_id_and_empty_version() {
    let raw = "application_id = \"bad|id\"\nversion = \"1.0\"\ncontent_sha256 = \"ab\"\n";
    let err = PackageHeader::from_toml_str(raw).expect_err("invalid id must fail");
    assert!(err.to_string().contains("not a valid application id"));

    let raw = "application_id = \"com.ok.app\"\nversion = \" \"\ncontent_sha256 = \"ab\"\n";
    let err = PackageHeader::from_toml_str(raw).expect_err("empty version must fail");
    assert!(err.to_string().contains("'version' field must not be empty"));
}

#[test]
fn installation_report_round_trip() {
    let mut report = InstallationReport {
        application_id: "com.example.nav".to_string(),
        installation_location_id: "internal-0".to_string(),
        disk_space_used: 4096,
        digest: "ab12cd".to_string(),
        hardware_id: "vin-123".to_string(),
        user_id: Some(1001),
        ..Default::default()
    };
    report
        .extra
        .insert("channel".to_string(), "beta".to_string());
    report
        .extra_signed
        .insert("store".to_string(), "oem".to_string());

    let raw = report.serialize();
    assert!(raw.starts_with("format_version=2\n"));

    let parsed = InstallationReport::parse(&raw).expect("must parse report");
    assert_eq!(parsed, report);
}

#[test]
fn installation_report_rejects_other_format_versions() {
    let raw = "format_version=1\napplication_id=x\ninstallation_location_id=internal-0\ndisk_space_used=1\ndigest=ab\n";
    let err = InstallationReport::parse(raw).expect_err("must reject old version");
    assert!(err.to_string().contains("unsupported installation report"));

    let raw = "application_id=x\n";
    let err = InstallationReport::parse(raw).expect_err("must reject missing version");
    assert!(err.to_string().contains("format_version"));
}

#[test]
fn installation_report_requires_core_fields() {
    let raw = "format_version=2\napplication_id=x\n";
    let err = InstallationReport::parse(raw).expect_err("must reject incomplete report");
    assert!(err.to_string().contains("missing installation_location_id"));
}

#[test]
fn error_code_round_trip() {
    for code in [
        ErrorCode::None,
        ErrorCode::Canceled,
        ErrorCode::Parse,
        ErrorCode::Signature,
        ErrorCode::IO,
        ErrorCode::Permissions,
        ErrorCode::Package,
    ] {
        assert_eq!(ErrorCode::parse(code.as_str()).expect("must parse"), code);
    }
    assert!(ErrorCode::parse("bogus").is_err());
}
