use serde::{Deserialize, Serialize};

/// One predicted bounding box in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub conf: f32,
    pub class_id: i64,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Response body for `POST /predict`; also the record stored in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub has_fracture: bool,
    pub best_confidence: f32,
    pub num_boxes: usize,
    pub boxes: Vec<Detection>,
    pub annotated_image_b64: String,
    pub width: u32,
    pub height: u32,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<PredictionResponse>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_owned(),
        }
    }
}
