use crate::detect::DetectError;
use crate::features::FeatureVector;

/// Per-feature normalisation statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerState {
    fields: &'static [&'static str],
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl ScalerState {
    pub fn fields(&self) -> &'static [&'static str] {
        self.fields
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }
}

/// Standard scaler: `(x - mean) / scale`, with population standard deviation as
/// the scale.
#[derive(Debug, Clone, Default)]
pub struct Scaler {
    state: Option<ScalerState>,
}

impl Scaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&ScalerState> {
        self.state.as_ref()
    }

    /// Compute mean and scale per feature over `batch`, replacing any previous
    /// state. Every vector must share the shape of the first one.
    pub fn fit(&mut self, batch: &[FeatureVector]) -> Result<(), DetectError> {
        let first = batch.first().ok_or(DetectError::EmptyBaseline)?;
        let fields = first.fields();
        if let Some(bad) = batch.iter().find(|v| !v.same_shape(fields)) {
            return Err(DetectError::shape(fields, bad.fields()));
        }

        let width = fields.len();
        let mut means = Vec::with_capacity(width);
        let mut scales = Vec::with_capacity(width);
        for col in 0..width {
            let (mean, std) = column_stats(batch.iter().map(|v| v.values()[col]));
            means.push(mean);
            // Constant feature: pass through rather than divide by zero.
            scales.push(if std > f64::EPSILON && std.is_finite() { std } else { 1.0 });
        }

        self.state = Some(ScalerState {
            fields,
            means,
            scales,
        });
        Ok(())
    }

    /// Scale one vector into model space.
    pub fn transform(&self, v: &FeatureVector) -> Result<FeatureVector, DetectError> {
        let state = self.state.as_ref().ok_or(DetectError::NotFitted)?;
        if !v.same_shape(state.fields) {
            return Err(DetectError::shape(state.fields, v.fields()));
        }

        let scaled = v
            .values()
            .iter()
            .zip(&state.means)
            .zip(&state.scales)
            .map(|((x, mean), scale)| ((x - mean) / scale).clamp(-f64::MAX, f64::MAX))
            .collect();
        Ok(v.with_values(scaled))
    }

    /// Scale a whole batch, failing on the first bad vector.
    pub fn transform_batch(&self, batch: &[FeatureVector]) -> Result<Vec<FeatureVector>, DetectError> {
        batch.iter().map(|v| self.transform(v)).collect()
    }
}

/// Mean and population standard deviation of one column.
///
/// Welford's running update over values divided by the column's largest
/// magnitude, so neither the sum nor the squared deviations overflow for
/// values near `f64::MAX`.
fn column_stats(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let unit = values.clone().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    if unit == 0.0 || !unit.is_finite() {
        return (0.0, 0.0);
    }

    let (mut n, mut mean, mut m2) = (0.0_f64, 0.0_f64, 0.0_f64);
    for x in values {
        let u = x / unit;
        n += 1.0;
        let delta = u - mean;
        mean += delta / n;
        m2 += delta * (u - mean);
    }
    (mean * unit, (m2 / n).sqrt() * unit)
}
