//! Tests for the Compose parser.

use super::*;
use crate::error::StackError;
use std::collections::BTreeMap;

#[test]
fn test_parse_basic_compose() {
    let yaml = r#"
version: "3"
services:
  web:
    image: images:debian/12
    ports:
      - "8080:80"
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    assert_eq!(compose.version, "3");
    assert_eq!(compose.services.len(), 1);

    let web = &compose.services["web"];
    assert_eq!(web.image, "images:debian/12");
    assert!(matches!(&web.ports[0], PortEntry::Short(s) if s == "8080:80"));
}

#[test]
fn test_parse_depends_on() {
    let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      - db
  db:
    image: postgres
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    assert_eq!(compose.services["web"].depends_on.names(), vec!["db"]);
}

#[test]
fn test_parse_volumes_short_and_long() {
    let yaml = r#"
services:
  db:
    image: postgres:16
    volumes:
      - db-data:/var/lib/postgresql/data
      - type: bind
        source: ./config
        target: /etc/postgresql
        read_only: true
        x-incus-shift: true

volumes:
  db-data:
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    let service = &compose.services["db"];
    assert_eq!(service.volumes.len(), 2);
    assert!(matches!(&service.volumes[0], ServiceVolume::Short(s) if s == "db-data:/var/lib/postgresql/data"));
    match &service.volumes[1] {
        ServiceVolume::Long(long) => {
            assert_eq!(long.kind.as_deref(), Some("bind"));
            assert!(long.read_only);
            assert!(long.extra.contains_key("x-incus-shift"));
        }
        other => panic!("expected long syntax, got {other:?}"),
    }
    assert!(compose.volumes.contains_key("db-data"));
}

#[test]
fn test_parse_extensions_are_kept() {
    let yaml = r#"
x-incus-default-profiles: [base]
services:
  app:
    image: myapp
    x-incus-gpu: true
    restart: always
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    assert!(compose.extra.contains_key("x-incus-default-profiles"));
    let app = &compose.services["app"];
    assert!(app.extra.contains_key("x-incus-gpu"));
    assert!(app.extra.contains_key("restart"));
}

#[test]
fn test_parse_labels() {
    let yaml = r#"
services:
  app:
    image: myapp
    labels:
      com.example.description: "Web application"
      com.example.version: 1.0
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    let labels = compose.services["app"].labels.to_map();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels["com.example.description"], "Web application");
    assert_eq!(labels["com.example.version"], "1.0");
}

#[test]
fn test_interpolation() {
    let yaml = r#"
services:
  web:
    image: "images:debian/${DEBIAN:-12}"
    environment:
      GREETING: "cost $$5"
"#;
    let vars = Variables::from_map(BTreeMap::new());
    let compose = ComposeParser::parse_with(yaml, std::path::Path::new("compose.yaml"), Some(&vars)).unwrap();
    let web = &compose.services["web"];
    assert_eq!(web.image, "images:debian/12");
    assert_eq!(web.environment.to_map()["GREETING"], Some("cost $5".to_string()));
}

#[test]
fn test_required_variable_missing() {
    let yaml = "services:\n  web:\n    image: \"${IMAGE:?set IMAGE}\"\n";
    let vars = Variables::default();
    let err = ComposeParser::parse_with(yaml, std::path::Path::new("compose.yaml"), Some(&vars)).unwrap_err();
    assert!(matches!(err, StackError::InvalidManifest { ref reason, .. } if reason.contains("IMAGE")));
}

#[test]
fn test_invalid_version() {
    let yaml = r#"
version: "1"
services:
  web:
    image: nginx
"#;
    match ComposeParser::parse(yaml).unwrap_err() {
        StackError::InvalidManifest { reason, .. } => assert!(reason.contains("'1'")),
        other => panic!("Expected InvalidManifest, got {other}"),
    }
}

#[test]
fn test_no_services() {
    let yaml = r#"
version: "3"
services: {}
"#;
    match ComposeParser::parse(yaml).unwrap_err() {
        StackError::InvalidManifest { reason, .. } => assert!(reason.contains("No services defined")),
        other => panic!("Expected InvalidManifest, got {other}"),
    }
}

#[test]
fn test_service_missing_image() {
    let yaml = r#"
services:
  web:
    ports:
      - "8080:80"
"#;
    assert!(ComposeParser::parse(yaml).is_err());
}

#[test]
fn test_malformed_yaml() {
    assert!(matches!(
        ComposeParser::parse("services: [unclosed").unwrap_err(),
        StackError::InvalidManifest { .. }
    ));
}

#[test]
fn test_load_from_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join(".env"), "WEB_IMAGE=images:alpine/3.20\n").unwrap();
    std::fs::write(
        dir.path().join("compose.yaml"),
        "name: shop\nservices:\n  web:\n    image: ${WEB_IMAGE}\n",
    )
    .unwrap();

    let stack = load(dir.path(), &LoadOptions::default()).unwrap();
    assert_eq!(stack.name, "shop");
    assert_eq!(stack.service("web").unwrap().image, "images:alpine/3.20");
}

#[test]
fn test_load_without_manifest() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(matches!(
        load(dir.path(), &LoadOptions::default()).unwrap_err(),
        StackError::ManifestNotFound { .. }
    ));
}
