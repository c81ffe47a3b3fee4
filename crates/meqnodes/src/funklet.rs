use meqcore::{Cells, NodeError, PerturbedSet, VellSet, Vells, FREQ, TIME};
use serde::{Deserialize, Serialize};

/// A parameterised function of the cells grid, as held by a parm.
pub trait Funklet: Send + Sync {
    /// Evaluates over `cells` (a scalar without cells). With `n_sets` > 0
    /// the result carries one perturbed value per set for `spid`: set 0 is
    /// perturbed by `+perturbation`, set 1 by `-perturbation`.
    fn evaluate(
        &self,
        cells: Option<&Cells>,
        spid: i32,
        perturbation: f64,
        n_sets: usize,
    ) -> Result<VellSet, NodeError>;

    /// Applies a solution increment to the solvable coefficient.
    fn update(&mut self, delta: f64);

    fn coeffs(&self) -> &[f64];
}

/// 2-D polynomial in normalised time and frequency. Coefficients are
/// stored time-major: `coeffs[i * nfreq + j]` multiplies `t^i f^j`.
/// Only the constant term is solvable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polc {
    pub coeffs: Vec<f64>,
    pub shape: [usize; 2],
    #[serde(default)]
    pub offset: [f64; 2],
    #[serde(default = "unit_scale")]
    pub scale: [f64; 2],
}

fn unit_scale() -> [f64; 2] {
    [1.0, 1.0]
}

impl Polc {
    pub fn constant(value: f64) -> Self {
        Self {
            coeffs: vec![value],
            shape: [1, 1],
            offset: [0.0, 0.0],
            scale: unit_scale(),
        }
    }

    pub fn new(coeffs: Vec<f64>, shape: [usize; 2]) -> Result<Self, NodeError> {
        if shape[0] * shape[1] != coeffs.len() || coeffs.is_empty() {
            return Err(NodeError::Configuration(format!(
                "polc of shape {:?} needs {} coefficients, got {}",
                shape,
                shape[0] * shape[1],
                coeffs.len()
            )));
        }
        Ok(Self {
            coeffs,
            shape,
            offset: [0.0, 0.0],
            scale: unit_scale(),
        })
    }

    pub fn with_offset(mut self, offset: [f64; 2], scale: [f64; 2]) -> Self {
        self.offset = offset;
        self.scale = scale;
        self
    }

    pub fn is_constant(&self) -> bool {
        self.shape == [1, 1]
    }

    fn value_at(&self, c0: f64, t: f64, f: f64) -> f64 {
        let t = (t - self.offset[0]) / self.scale[0];
        let f = (f - self.offset[1]) / self.scale[1];
        let mut sum = 0.0;
        let mut tp = 1.0;
        for i in 0..self.shape[0] {
            let mut fp = 1.0;
            for j in 0..self.shape[1] {
                let c = if i == 0 && j == 0 { c0 } else { self.coeffs[i * self.shape[1] + j] };
                sum += c * tp * fp;
                fp *= f;
            }
            tp *= t;
        }
        sum
    }

    fn grid(&self, cells: Option<&Cells>, c0: f64) -> Result<Vells, NodeError> {
        let Some(cells) = cells.filter(|_| !self.is_constant()) else {
            return Ok(Vells::Scalar(c0));
        };
        match cells.rank() {
            1 => {
                let data = cells.centers(TIME).iter().map(|&t| self.value_at(c0, t, 0.0)).collect();
                Vells::array(cells.shape(), data)
            }
            2 => {
                let times = cells.centers(TIME);
                let freqs = cells.centers(FREQ);
                let data = times
                    .iter()
                    .flat_map(|&t| freqs.iter().map(move |&f| (t, f)))
                    .map(|(t, f)| self.value_at(c0, t, f))
                    .collect();
                Vells::array(cells.shape(), data)
            }
            n => Err(NodeError::CellsMismatch(format!(
                "polc cannot be evaluated on {} axes",
                n
            ))),
        }
    }
}

impl Funklet for Polc {
    fn evaluate(
        &self,
        cells: Option<&Cells>,
        spid: i32,
        perturbation: f64,
        n_sets: usize,
    ) -> Result<VellSet, NodeError> {
        let c0 = self.coeffs[0];
        let mut vs = VellSet::new(self.grid(cells, c0)?);
        if n_sets > 0 {
            vs.spids = vec![spid];
            vs.perturbations = vec![perturbation];
            vs.perturbed_sets = (0..n_sets)
                .map(|set| {
                    let sign = if set == 0 { 1.0 } else { -1.0 };
                    self.grid(cells, c0 + sign * perturbation)
                        .map(|v| PerturbedSet { values: vec![v] })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(vs)
    }

    fn update(&mut self, delta: f64) {
        self.coeffs[0] += delta;
    }

    fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }
}
