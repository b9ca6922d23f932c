//! Reference captions and predictions stored as JSON.
//!
//! References use the COCO caption format, predictions the format written by the evaluation
//! scripts. Item ids can be numbers or strings, they are always compared as strings.
use std::collections::HashMap;
use std::path::Path;

use candle::Result;
use serde::{Deserialize, Deserializer};

/// Reference captions grouped by item id, in file order.
pub type Refs = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Prediction {
    #[serde(alias = "image_id", deserialize_with = "item_id")]
    pub item_id: String,
    pub caption: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(serde_json::Number),
    String(String),
}

fn item_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let id = match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n.to_string(),
        RawId::String(s) => s,
    };
    Ok(id)
}

#[derive(Deserialize)]
struct Annotation {
    #[serde(deserialize_with = "item_id")]
    image_id: String,
    caption: String,
}

#[derive(Deserialize)]
struct CocoFile {
    annotations: Vec<Annotation>,
}

#[derive(Deserialize)]
struct PredictionFile {
    predictions: Vec<Prediction>,
}

pub fn parse_gt_refs(json: &str) -> Result<Refs> {
    let coco: CocoFile = serde_json::from_str(json).map_err(candle::Error::wrap)?;
    let mut refs = Refs::new();
    for ann in coco.annotations {
        refs.entry(ann.image_id).or_default().push(ann.caption)
    }
    Ok(refs)
}

/// Loads the references of a COCO format annotation file.
pub fn load_gt_refs<P: AsRef<Path>>(path: P) -> Result<Refs> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let refs = parse_gt_refs(&json)?;
    tracing::debug!(path = ?path.as_ref(), items = refs.len(), "loaded references");
    Ok(refs)
}

pub fn parse_predictions(json: &str) -> Result<Vec<Prediction>> {
    let file: PredictionFile = serde_json::from_str(json).map_err(candle::Error::wrap)?;
    Ok(file.predictions)
}

/// Loads `{"predictions": [{"image_id": .., "caption": ..}, ..]}`, `item_id` is accepted as
/// the id key too.
pub fn load_predictions<P: AsRef<Path>>(path: P) -> Result<Vec<Prediction>> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let predictions = parse_predictions(&json)?;
    tracing::debug!(path = ?path.as_ref(), n = predictions.len(), "loaded predictions");
    Ok(predictions)
}
