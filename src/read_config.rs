use crate::bitfield::{DEFAULT_ALARM_BITS, MAX_ALARM_BITS, WORD_BITS};
use crate::catalog::{AlarmCatalog, CatalogEntry};
use crate::monitor::MonitorSettings;
use roxmltree::{Document, Node};
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

pub const NAMESPACE: &str = "http://www.elektro-kapsel.se/alarmmonitor/v1";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Xml(roxmltree::Error),
    WrongNamespace(String),
    UnexpectedElement(String),
    MissingAttribute {
        element: String,
        attribute: String,
    },
    InvalidValue {
        element: String,
        value: String,
    },
}

use ConfigError::*;

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            Io(e) => write!(f, "Failed to read configuration: {}", e),
            Xml(e) => write!(f, "Invalid XML: {}", e),
            WrongNamespace(ns) => write!(f, "Unexpected namespace '{}'", ns),
            UnexpectedElement(name) => write!(f, "Unexpected element '{}'", name),
            MissingAttribute { element, attribute } => write!(
                f,
                "Missing attribute '{}' on element '{}'",
                attribute, element
            ),
            InvalidValue { element, value } => {
                write!(f, "Invalid value '{}' for '{}'", value, element)
            }
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> ConfigError {
        Io(e)
    }
}

impl From<roxmltree::Error> for ConfigError {
    fn from(e: roxmltree::Error) -> ConfigError {
        Xml(e)
    }
}

/// Descriptions and warning flags for one index space
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    pub entries: Vec<CatalogEntry>,
    pub warnings: Vec<usize>,
}

impl CatalogConfig {
    pub fn build(&self) -> AlarmCatalog {
        AlarmCatalog::new(self.entries.iter().cloned(), self.warnings.iter().copied())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub bind: String,
    pub tag_pattern: String,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub alarm_bits: usize,
    pub read_concurrency: usize,
    pub equipment: Option<String>,
    /// File receiving alarm records, stdout if not set
    pub journal: Option<String>,
    pub alarms: CatalogConfig,
    pub codes: CatalogConfig,
}

impl Default for MonitorConfig {
    fn default() -> MonitorConfig {
        MonitorConfig {
            bind: "/tmp/siemens/automation/HmiRunTime".to_string(),
            tag_pattern: "AlarmWord_{}".to_string(),
            read_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            alarm_bits: DEFAULT_ALARM_BITS,
            read_concurrency: 1,
            equipment: None,
            journal: None,
            alarms: CatalogConfig::default(),
            codes: CatalogConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            alarm_bits: self.alarm_bits,
            poll_interval: self.poll_interval,
            read_concurrency: self.read_concurrency,
            equipment: self.equipment.clone(),
        }
    }
}

pub fn parse_duration(time_str: &str) -> Result<Duration, ConfigError> {
    let invalid = || InvalidValue {
        element: "duration".to_string(),
        value: time_str.to_string(),
    };
    let time_str = time_str.trim();
    let (value_str, scale) = if let Some(v) = time_str.strip_suffix("ms") {
        (v, 0.001)
    } else if let Some(v) = time_str.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = time_str.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = time_str.strip_suffix('h') {
        (v, 60.0 * 60.0)
    } else {
        return Err(invalid());
    };
    let value: f64 = value_str.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(value * scale))
}

fn elements<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn text_content(node: Node) -> String {
    node.text().unwrap_or("").trim().to_string()
}

fn parse_value<T: FromStr>(element: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| InvalidValue {
        element: element.to_string(),
        value: value.to_string(),
    })
}

fn required_attr<'a>(node: Node<'a, '_>, attribute: &str) -> Result<&'a str, ConfigError> {
    node.attribute(attribute).ok_or_else(|| MissingAttribute {
        element: node.tag_name().name().to_string(),
        attribute: attribute.to_string(),
    })
}

fn parse_words(node: Node, conf: &mut MonitorConfig) -> Result<(), ConfigError> {
    if let Some(tag) = node.attribute("tag") {
        conf.tag_pattern = tag.to_string();
    }
    if let Some(bits) = node.attribute("bits") {
        let alarm_bits: usize = parse_value("bits", bits)?;
        if alarm_bits > MAX_ALARM_BITS {
            return Err(InvalidValue {
                element: "bits".to_string(),
                value: bits.to_string(),
            });
        }
        conf.alarm_bits = alarm_bits;
    }
    if let Some(word_bits) = node.attribute("word_bits") {
        // Only 32-bit words are supported
        if parse_value::<usize>("word_bits", word_bits)? != WORD_BITS {
            return Err(InvalidValue {
                element: "word_bits".to_string(),
                value: word_bits.to_string(),
            });
        }
    }
    if let Some(concurrency) = node.attribute("concurrency") {
        let concurrency: usize = parse_value("concurrency", concurrency)?;
        if concurrency == 0 {
            return Err(InvalidValue {
                element: "concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        conf.read_concurrency = concurrency;
    }
    if let Some(timeout) = node.attribute("timeout") {
        conf.read_timeout = parse_duration(timeout)?;
    }
    Ok(())
}

fn parse_catalog(node: Node) -> Result<CatalogConfig, ConfigError> {
    let mut catalog = CatalogConfig::default();
    for child in elements(node) {
        let name = child.tag_name().name();
        let warning = match name {
            "alarm" => false,
            "warning" => true,
            _ => return Err(UnexpectedElement(name.to_string())),
        };
        let index: usize = parse_value("index", required_attr(child, "index")?)?;
        let template = text_content(child);
        if template.is_empty() {
            // Classification only, keeps the default description
            if warning {
                catalog.warnings.push(index);
            }
        } else {
            catalog.entries.push(CatalogEntry {
                index,
                template,
                warning,
            });
        }
    }
    Ok(catalog)
}

pub fn read_file<R: Read>(mut source: R) -> Result<MonitorConfig, ConfigError> {
    let mut text = String::new();
    source.read_to_string(&mut text)?;
    let doc = Document::parse(&text)?;
    let top = doc.root_element();
    match top.tag_name().namespace() {
        Some(NAMESPACE) => {}
        ns => return Err(WrongNamespace(ns.unwrap_or("").to_string())),
    }
    if top.tag_name().name() != "alarmmonitor" {
        return Err(UnexpectedElement(top.tag_name().name().to_string()));
    }
    let mut conf = MonitorConfig::default();
    for node in elements(top) {
        match node.tag_name().name() {
            "bind" => conf.bind = text_content(node),
            "words" => parse_words(node, &mut conf)?,
            "poll" => conf.poll_interval = parse_duration(required_attr(node, "interval")?)?,
            "equipment" => conf.equipment = Some(text_content(node)),
            "journal" => conf.journal = Some(text_content(node)),
            "alarms" => conf.alarms = parse_catalog(node)?,
            "codes" => conf.codes = parse_catalog(node)?,
            name => return Err(UnexpectedElement(name.to_string())),
        }
    }
    Ok(conf)
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
    assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
    assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
    assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    assert!(parse_duration("5").is_err());
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("-1s").is_err());
}

#[test]
fn test_parser() {
    let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1">
  <bind>/tmp/siemens/automation/HmiRunTime</bind>
  <words tag="Alarms[{}]" bits="64" word_bits="32" concurrency="4" timeout="500ms"/>
  <poll interval="2s"/>
  <equipment>Press 3</equipment>
  <journal>/var/log/alarm_monitor/alarms.json</journal>
  <alarms>
    <alarm index="0">Emergency stop on {equipment}</alarm>
    <warning index="12">Oil level low on {equipment}</warning>
    <warning index="40"/>
  </alarms>
  <codes>
    <alarm index="17">Door {index} open</alarm>
  </codes>
</alarmmonitor>
"#;
    let conf = read_file(str::as_bytes(doc)).unwrap();
    assert_eq!(conf.bind, "/tmp/siemens/automation/HmiRunTime");
    assert_eq!(conf.tag_pattern, "Alarms[{}]");
    assert_eq!(conf.alarm_bits, 64);
    assert_eq!(conf.read_concurrency, 4);
    assert_eq!(conf.read_timeout, Duration::from_millis(500));
    assert_eq!(conf.poll_interval, Duration::from_secs(2));
    assert_eq!(conf.equipment.as_deref(), Some("Press 3"));
    assert_eq!(conf.alarms.entries.len(), 2);
    assert_eq!(conf.alarms.warnings, vec![40]);

    let catalog = conf.alarms.build();
    let described = catalog.describe(12, conf.equipment.as_deref());
    assert_eq!(described.text, "Oil level low on Press 3");
    assert_eq!(catalog.classify(40), crate::catalog::Severity::Warning);
    assert_eq!(catalog.classify(0), crate::catalog::Severity::Alarm);
    let codes = conf.codes.build();
    assert_eq!(codes.describe(17, None).text, "Door 17 open");

    let settings = conf.monitor_settings();
    assert_eq!(settings.alarm_bits, 64);
    assert_eq!(settings.read_concurrency, 4);
}

#[test]
fn test_defaults() {
    let doc = r#"<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1"/>"#;
    let conf = read_file(str::as_bytes(doc)).unwrap();
    assert_eq!(conf.alarm_bits, DEFAULT_ALARM_BITS);
    assert_eq!(conf.tag_pattern, "AlarmWord_{}");
    assert!(conf.journal.is_none());
    assert!(conf.alarms.build().is_empty());
}

#[test]
fn test_errors() {
    let wrong_ns = r#"<alarmmonitor xmlns="http://example.com/other"/>"#;
    assert!(matches!(read_file(str::as_bytes(wrong_ns)), Err(WrongNamespace(_))));

    let bad_word_bits = r#"<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1">
<words word_bits="16"/></alarmmonitor>"#;
    assert!(matches!(
        read_file(str::as_bytes(bad_word_bits)),
        Err(InvalidValue { .. })
    ));

    let too_many_bits = r#"<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1">
<words bits="18446744073709551615"/></alarmmonitor>"#;
    assert!(matches!(
        read_file(str::as_bytes(too_many_bits)),
        Err(InvalidValue { ref element, .. }) if element == "bits"
    ));
    let max_bits = format!(
        r#"<alarmmonitor xmlns="{}"><words bits="{}"/></alarmmonitor>"#,
        NAMESPACE, MAX_ALARM_BITS
    );
    assert_eq!(read_file(max_bits.as_bytes()).unwrap().alarm_bits, MAX_ALARM_BITS);

    let missing_index = r#"<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1">
<alarms><alarm>Text</alarm></alarms></alarmmonitor>"#;
    assert!(matches!(
        read_file(str::as_bytes(missing_index)),
        Err(MissingAttribute { .. })
    ));

    let unknown = r#"<alarmmonitor xmlns="http://www.elektro-kapsel.se/alarmmonitor/v1">
<clips/></alarmmonitor>"#;
    assert!(matches!(
        read_file(str::as_bytes(unknown)),
        Err(UnexpectedElement(_))
    ));
}
