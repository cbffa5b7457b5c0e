//! Core domain types: procurement item records.

use serde::{Deserialize, Deserializer, Serialize};

/// JSON labels of the item fields, in schema order.
///
/// These are the keys written to `items/<model>/<stem>.json` and the field
/// list both refinement roles are instructed to look for.
pub const ITEM_FIELD_LABELS: [&str; 15] = [
    "Наименование",
    "Марка",
    "Тип",
    "Количество",
    "Единица измерения",
    "Наличие аналогов",
    "Код ОКДП2",
    "Сведения о новизне",
    "Область применения",
    "Условия эксплуатации",
    "Технические требования",
    "Комплектация",
    "Требования по правилам сдачи и приемки",
    "Требования к транспортированию",
    "Требования к хранению",
];

// ---------------------------------------------------------------------------
// HasAnalogues
// ---------------------------------------------------------------------------

/// Whether analogues of the item are acceptable ("Да" / "Нет").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HasAnalogues {
    #[serde(rename = "Да")]
    Yes,
    #[serde(rename = "Нет")]
    No,
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// One procurement line item extracted from a technical specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "Наименование")]
    pub name: String,
    #[serde(rename = "Марка", default)]
    pub brand: Option<String>,
    #[serde(rename = "Тип", default)]
    pub kind: Option<String>,
    #[serde(rename = "Количество", default, deserialize_with = "lenient_quantity")]
    pub quantity: Option<f64>,
    #[serde(rename = "Единица измерения", default)]
    pub unit_of_measurement: Option<String>,
    #[serde(rename = "Наличие аналогов", default)]
    pub has_analogues: Option<HasAnalogues>,
    #[serde(rename = "Код ОКДП2", default)]
    pub okdp2_code: Option<String>,
    #[serde(rename = "Сведения о новизне", default)]
    pub novelty_info: Option<String>,
    #[serde(rename = "Область применения", default)]
    pub application_area: Option<String>,
    #[serde(rename = "Условия эксплуатации", default)]
    pub operating_conditions: Option<String>,
    #[serde(rename = "Технические требования", default)]
    pub technical_requirements: Option<String>,
    #[serde(rename = "Комплектация", default)]
    pub configuration: Option<String>,
    #[serde(rename = "Требования по правилам сдачи и приемки", default)]
    pub acceptance_rules: Option<String>,
    #[serde(rename = "Требования к транспортированию", default)]
    pub transportation_requirements: Option<String>,
    #[serde(rename = "Требования к хранению", default)]
    pub storage_requirements: Option<String>,
}

impl Item {
    /// An item with only a name; every other field null.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brand: None,
            kind: None,
            quantity: None,
            unit_of_measurement: None,
            has_analogues: None,
            okdp2_code: None,
            novelty_info: None,
            application_area: None,
            operating_conditions: None,
            technical_requirements: None,
            configuration: None,
            acceptance_rules: None,
            transportation_requirements: None,
            storage_requirements: None,
        }
    }
}

/// Accept a number, a numeric string (decimal comma allowed) or null.
fn lenient_quantity<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => {
            let normalized: String = s
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            if normalized.is_empty() {
                return Ok(None);
            }
            normalized.parse::<f64>().map(Some).map_err(|_| {
                serde::de::Error::custom(format!("quantity is not a number: {s:?}"))
            })
        }
    }
}

// ---------------------------------------------------------------------------
// ItemList
// ---------------------------------------------------------------------------

/// Ordered items of one document (document order, duplicates allowed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemList(pub Vec<Item>);

impl ItemList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.0.iter()
    }
}
