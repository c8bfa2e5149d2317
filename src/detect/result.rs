use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One detection box reported by a detector backend.
///
/// Coordinates are normalized (0..1) relative to the frame, origin top-left.
/// The core never interprets boxes beyond drawing them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

impl Detection {
    pub fn new(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            confidence,
        }
    }
}

/// Per-frame detector output: class name to a non-empty list of boxes.
///
/// Classes are kept in a `BTreeMap` so iteration order is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    classes: BTreeMap<String, Vec<Detection>>,
}

impl DetectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add boxes for a class. Empty box lists are ignored so every present
    /// class always has at least one box.
    pub fn insert(&mut self, class: impl Into<String>, boxes: Vec<Detection>) {
        if boxes.is_empty() {
            return;
        }
        self.classes.entry(class.into()).or_default().extend(boxes);
    }

    /// Builder-style variant of [`DetectionSet::insert`].
    pub fn with(mut self, class: impl Into<String>, boxes: Vec<Detection>) -> Self {
        self.insert(class, boxes);
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn boxes(&self, class: &str) -> &[Detection] {
        self.classes.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Detection])> {
        self.classes
            .iter()
            .map(|(class, boxes)| (class.as_str(), boxes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
