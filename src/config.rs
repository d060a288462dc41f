use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration, read once at startup from CLI flags or the
/// environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "fracture-backend", about = "Fracture detection API server")]
pub struct Config {
    /// Host address to bind.
    #[arg(long, env = "FRACTURE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind.
    #[arg(long, env = "FRACTURE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Path to the ONNX detection model.
    #[arg(long, env = "FRACTURE_MODEL", default_value = "weights/best.onnx")]
    pub model_path: PathBuf,

    /// Square input size the model expects, in pixels.
    #[arg(long, env = "FRACTURE_INPUT_SIZE", default_value_t = 640)]
    pub input_size: u32,

    /// Minimum confidence for a detection to be kept.
    #[arg(long, env = "FRACTURE_CONF_THRESHOLD", default_value_t = 0.25)]
    pub conf_threshold: f32,

    /// IoU threshold for non-max suppression.
    #[arg(long, env = "FRACTURE_IOU_THRESHOLD", default_value_t = 0.45)]
    pub iou_threshold: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_served_configuration() {
        let config = Config::parse_from(["fracture-backend"]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.model_path, PathBuf::from("weights/best.onnx"));
        assert_eq!(config.input_size, 640);
        assert!((config.conf_threshold - 0.25).abs() < f32::EPSILON);
        assert!((config.iou_threshold - 0.45).abs() < f32::EPSILON);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "fracture-backend",
            "--port",
            "9000",
            "--model-path",
            "models/fracture.onnx",
            "--conf-threshold",
            "0.5",
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.model_path, PathBuf::from("models/fracture.onnx"));
        assert!((config.conf_threshold - 0.5).abs() < f32::EPSILON);
    }
}
