use serde::{Deserialize, Serialize};

pub const TIME: usize = 0;
pub const FREQ: usize = 1;

/// One regularly sampled axis of a cells grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub start: f64,
    pub end: f64,
    pub num: usize,
}

impl Axis {
    pub fn new(name: impl Into<String>, start: f64, end: f64, num: usize) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            num,
        }
    }

    pub fn width(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            (self.end - self.start) / self.num as f64
        }
    }

    pub fn centers(&self) -> Vec<f64> {
        let w = self.width();
        (0..self.num)
            .map(|i| self.start + w * (i as f64 + 0.5))
            .collect()
    }

    pub fn same_domain(&self, other: &Axis) -> bool {
        self.name == other.name
            && (self.start - other.start).abs() <= f64::EPSILON * self.start.abs().max(1.0)
            && (self.end - other.end).abs() <= f64::EPSILON * self.end.abs().max(1.0)
    }

    pub fn with_num(&self, num: usize) -> Axis {
        Axis {
            num,
            ..self.clone()
        }
    }
}

/// Sampling grid of a request: a domain plus a regular number of cells per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cells {
    pub axes: Vec<Axis>,
}

impl Cells {
    pub fn new(axes: Vec<Axis>) -> Self {
        Self { axes }
    }

    /// Time/frequency grid.
    pub fn time_freq(time: (f64, f64, usize), freq: (f64, f64, usize)) -> Self {
        Self::new(vec![
            Axis::new("time", time.0, time.1, time.2),
            Axis::new("freq", freq.0, freq.1, freq.2),
        ])
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.num).collect()
    }

    pub fn num_cells(&self) -> usize {
        self.axes.iter().map(|a| a.num).product()
    }

    pub fn axis(&self, i: usize) -> Option<&Axis> {
        self.axes.get(i)
    }

    pub fn centers(&self, i: usize) -> Vec<f64> {
        self.axes.get(i).map(Axis::centers).unwrap_or_default()
    }

    /// Same axes over the same domain, regardless of sampling.
    pub fn same_domain(&self, other: &Cells) -> bool {
        self.axes.len() == other.axes.len()
            && self
                .axes
                .iter()
                .zip(&other.axes)
                .all(|(a, b)| a.same_domain(b))
    }

    /// Same domain and the same sampling.
    pub fn same_grid(&self, other: &Cells) -> bool {
        self.same_domain(other) && self.shape() == other.shape()
    }

    pub fn with_shape(&self, shape: &[usize]) -> Cells {
        Cells {
            axes: self
                .axes
                .iter()
                .zip(shape)
                .map(|(a, &n)| a.with_num(n))
                .collect(),
        }
    }
}
