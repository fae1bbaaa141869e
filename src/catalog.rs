use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::combinator::{map, value};
use nom::multi::many0;
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Alarm,
    Warning,
}

impl Severity {
    /// Numeric type stored with persisted alarm records
    pub fn type_code(&self) -> u8 {
        match self {
            Severity::Alarm => 1,
            Severity::Warning => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Alarm => "Alarm",
            Severity::Warning => "Warning",
        }
    }
}

const DEFAULT_TEMPLATE: &str = "Alarm {index} has been triggered";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Equipment,
    Index,
}

fn segment(input: &str) -> IResult<&str, Segment> {
    alt((
        value(Segment::Equipment, tag("{equipment}")),
        value(Segment::Index, tag("{index}")),
        map(is_not("{"), |s: &str| Segment::Literal(s.to_string())),
        // A brace that doesn't start a known placeholder
        map(tag("{"), |s: &str| Segment::Literal(s.to_string())),
    ))(input)
}

/// Description text with `{equipment}` and `{index}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Template {
        let segments = match many0(segment)(text) {
            Ok((_, segments)) => segments,
            Err(_) => vec![Segment::Literal(text.to_string())],
        };
        Template { segments }
    }

    pub fn render(&self, index: usize, equipment: Option<&str>) -> String {
        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Equipment => text.push_str(equipment.unwrap_or("")),
                Segment::Index => text.push_str(&index.to_string()),
            }
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub index: usize,
    pub template: String,
    pub warning: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub text: String,
    pub severity: Severity,
}

/// Static description and classification of every known alarm.
///
/// Built once from configuration and never changed afterwards.
#[derive(Debug, Clone)]
pub struct AlarmCatalog {
    templates: HashMap<usize, Template>,
    warnings: HashSet<usize>,
    default_template: Template,
}

impl AlarmCatalog {
    /// Entries flagged as warnings are added to the warning set.
    pub fn new<E, W>(entries: E, warnings: W) -> AlarmCatalog
    where
        E: IntoIterator<Item = CatalogEntry>,
        W: IntoIterator<Item = usize>,
    {
        let mut templates = HashMap::new();
        let mut warnings: HashSet<usize> = warnings.into_iter().collect();
        for entry in entries {
            if entry.warning {
                warnings.insert(entry.index);
            }
            templates.insert(entry.index, Template::parse(&entry.template));
        }
        AlarmCatalog {
            templates,
            warnings,
            default_template: Template::parse(DEFAULT_TEMPLATE),
        }
    }

    pub fn classify(&self, index: usize) -> Severity {
        if self.warnings.contains(&index) {
            Severity::Warning
        } else {
            Severity::Alarm
        }
    }

    /// Unknown indices get a generic description, this is not an error.
    pub fn describe(&self, index: usize, equipment: Option<&str>) -> Description {
        let template = self.templates.get(&index).unwrap_or(&self.default_template);
        Description {
            text: template.render(index, equipment),
            severity: self.classify(index),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.templates.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for AlarmCatalog {
    fn default() -> AlarmCatalog {
        AlarmCatalog::new(Vec::new(), Vec::new())
    }
}

#[cfg(test)]
fn test_catalog() -> AlarmCatalog {
    AlarmCatalog::new(
        vec![
            CatalogEntry {
                index: 12,
                template: "Motor overload on {equipment}".to_string(),
                warning: false,
            },
            CatalogEntry {
                index: 90,
                template: "Filter {index} clogged".to_string(),
                warning: true,
            },
        ],
        vec![81],
    )
}

#[test]
fn test_classify() {
    let catalog = test_catalog();
    assert_eq!(catalog.classify(81), Severity::Warning);
    assert_eq!(catalog.classify(90), Severity::Warning);
    assert_eq!(catalog.classify(50), Severity::Alarm);
    assert_eq!(catalog.classify(12), Severity::Alarm);
}

#[test]
fn test_describe() {
    let catalog = test_catalog();
    assert_eq!(
        catalog.describe(12, Some("Kiln 2")),
        Description {
            text: "Motor overload on Kiln 2".to_string(),
            severity: Severity::Alarm
        }
    );
    assert_eq!(catalog.describe(12, None).text, "Motor overload on ");
    assert_eq!(catalog.describe(90, None).text, "Filter 90 clogged");
    assert_eq!(
        catalog.describe(81, Some("Kiln 2")),
        Description {
            text: "Alarm 81 has been triggered".to_string(),
            severity: Severity::Warning
        }
    );
    assert_eq!(
        catalog.describe(500, None).text,
        "Alarm 500 has been triggered"
    );
}

#[test]
fn test_template() {
    assert_eq!(Template::parse("").render(1, None), "");
    assert_eq!(
        Template::parse("{equipment}: level {index}").render(7, Some("Tank")),
        "Tank: level 7"
    );
    assert_eq!(
        Template::parse("Braces {} and {name} stay").render(7, Some("Tank")),
        "Braces {} and {name} stay"
    );
    assert_eq!(Template::parse("{{index}").render(3, None), "{3");
}
