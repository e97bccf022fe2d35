// =============================================================================
// Price Predictor — pretrained scaled-linear regressor
// =============================================================================
//
// The artifact is a JSON file carrying the feature order, per-feature scaler
// mean/std, weights, bias, model version and prediction horizon. Loading
// validates the artifact against the engine's canonical feature list; a
// mismatch is fatal at startup. Evaluation is pure: features are arranged in
// artifact order, scaled, and dotted with the weights. A feature missing at
// tick time is imputed with its scaler mean (neutral after scaling).

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::features::{FeatureVector, MODEL_FEATURES};

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// On-disk model format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    /// Prediction horizon in milliseconds.
    pub horizon_ms: u64,
    /// Feature names in model-input order.
    pub features: Vec<String>,
    pub scaler_mean: Vec<f64>,
    pub scaler_std: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PricePredictor {
    artifact: ModelArtifact,
}

impl PricePredictor {
    /// Load and validate the model artifact. Failure here is fatal: the
    /// engine must not start without a usable model.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model artifact from {}", path.display()))?;

        let artifact: ModelArtifact = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse model artifact from {}", path.display()))?;

        let predictor = Self::from_artifact(artifact)?;

        info!(
            path = %path.display(),
            version = %predictor.artifact.version,
            horizon_ms = predictor.artifact.horizon_ms,
            features = predictor.artifact.features.len(),
            "model artifact loaded"
        );

        Ok(predictor)
    }

    /// Validate an already-parsed artifact.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        let n = artifact.features.len();
        if n == 0 {
            bail!("model artifact lists no features");
        }
        if artifact.features.len() != MODEL_FEATURES.len() {
            bail!(
                "model artifact has {} features, engine expects {}",
                artifact.features.len(),
                MODEL_FEATURES.len()
            );
        }
        for (i, (have, want)) in artifact
            .features
            .iter()
            .zip(MODEL_FEATURES.iter())
            .enumerate()
        {
            if have != want {
                bail!("model feature order mismatch at index {i}: artifact has '{have}', engine expects '{want}'");
            }
        }

        if artifact.scaler_mean.len() != n || artifact.scaler_std.len() != n {
            bail!("scaler length does not match feature count");
        }
        if artifact.weights.len() != n {
            bail!("weight length does not match feature count");
        }

        for (i, &std) in artifact.scaler_std.iter().enumerate() {
            if !std.is_finite() || std <= 0.0 {
                bail!("scaler std for '{}' is not positive finite", artifact.features[i]);
            }
        }
        for &v in artifact.scaler_mean.iter().chain(artifact.weights.iter()) {
            if !v.is_finite() {
                bail!("model artifact contains a non-finite parameter");
            }
        }
        if !artifact.bias.is_finite() {
            bail!("model bias is not finite");
        }
        if artifact.horizon_ms == 0 {
            bail!("model horizon must be positive");
        }

        Ok(Self { artifact })
    }

    pub fn version(&self) -> &str {
        &self.artifact.version
    }

    pub fn horizon_ms(&self) -> u64 {
        self.artifact.horizon_ms
    }

    /// Evaluate the regressor against a feature vector, producing the
    /// predicted price at `horizon_ms`. Stateless and side-effect free.
    pub fn predict(&self, fv: &FeatureVector) -> Result<f64> {
        let mut acc = self.artifact.bias;

        for (i, name) in self.artifact.features.iter().enumerate() {
            let raw = match fv.model_value(name) {
                Some(Some(v)) => v,
                // Missing feature: impute the scaler mean, i.e. zero after
                // scaling.
                Some(None) => self.artifact.scaler_mean[i],
                None => bail!("feature vector does not carry '{name}'"),
            };

            let scaled = (raw - self.artifact.scaler_mean[i]) / self.artifact.scaler_std[i];
            acc += self.artifact.weights[i] * scaled;
        }

        if !acc.is_finite() {
            bail!("model produced a non-finite prediction");
        }
        if acc <= 0.0 {
            bail!("model produced a non-positive price: {acc}");
        }

        Ok(acc)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn identity_artifact(weight_on: &str) -> ModelArtifact {
        let n = MODEL_FEATURES.len();
        let weights = MODEL_FEATURES
            .iter()
            .map(|name| if *name == weight_on { 1.0 } else { 0.0 })
            .collect();
        ModelArtifact {
            version: "test-1".into(),
            horizon_ms: 10_000,
            features: MODEL_FEATURES.iter().map(|s| s.to_string()).collect(),
            scaler_mean: vec![0.0; n],
            scaler_std: vec![1.0; n],
            weights,
            bias: 0.0,
        }
    }

    #[test]
    fn identity_model_echoes_price() {
        let predictor = PricePredictor::from_artifact(identity_artifact("price")).unwrap();
        let mut fv = FeatureVector::empty(0);
        fv.price = Some(50_000.0);
        let p = predictor.predict(&fv).unwrap();
        assert!((p - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn missing_feature_is_imputed_with_scaler_mean() {
        let mut artifact = identity_artifact("price");
        // Mean 100, so a missing price contributes zero after scaling and the
        // bias carries the output.
        artifact.scaler_mean[0] = 100.0;
        artifact.bias = 100.0;
        let predictor = PricePredictor::from_artifact(artifact).unwrap();

        let fv = FeatureVector::empty(0);
        let p = predictor.predict(&fv).unwrap();
        assert!((p - 100.0).abs() < 1e-9);
    }

    #[test]
    fn feature_order_mismatch_is_rejected() {
        let mut artifact = identity_artifact("price");
        artifact.features.swap(0, 1);
        let err = PricePredictor::from_artifact(artifact).unwrap_err();
        assert!(err.to_string().contains("order mismatch"));
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let mut artifact = identity_artifact("price");
        artifact.features.pop();
        assert!(PricePredictor::from_artifact(artifact).is_err());
    }

    #[test]
    fn zero_scaler_std_is_rejected() {
        let mut artifact = identity_artifact("price");
        artifact.scaler_std[3] = 0.0;
        assert!(PricePredictor::from_artifact(artifact).is_err());
    }

    #[test]
    fn non_positive_prediction_is_an_error() {
        let mut artifact = identity_artifact("price");
        artifact.bias = -1.0e9;
        let predictor = PricePredictor::from_artifact(artifact).unwrap();
        let mut fv = FeatureVector::empty(0);
        fv.price = Some(50_000.0);
        assert!(predictor.predict(&fv).is_err());
    }

    #[test]
    fn artifact_roundtrips_through_json() {
        let artifact = identity_artifact("mid");
        let json = serde_json::to_string(&artifact).unwrap();
        let back: ModelArtifact = serde_json::from_str(&json).unwrap();
        let predictor = PricePredictor::from_artifact(back).unwrap();
        assert_eq!(predictor.version(), "test-1");
        assert_eq!(predictor.horizon_ms(), 10_000);
    }
}
