use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::NodeError;

/// Values over a cells grid: either one scalar for every cell, or a dense
/// row-major array (first axis slowest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Vells {
    Scalar(f64),
    Array { shape: Vec<usize>, data: Arc<Vec<f64>> },
}

impl Vells {
    pub fn array(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, NodeError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(NodeError::ShapeMismatch(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Vells::Array {
            shape,
            data: Arc::new(data),
        })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Vells::Scalar(_))
    }

    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Vells::Scalar(_) => None,
            Vells::Array { shape, .. } => Some(shape),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Vells::Scalar(v) => Some(*v),
            Vells::Array { data, .. } if data.len() == 1 => Some(data[0]),
            Vells::Array { .. } => None,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match self {
            Vells::Scalar(v) => vec![*v],
            Vells::Array { data, .. } => data.as_ref().clone(),
        }
    }

    /// Element-wise combination; scalars broadcast against arrays.
    pub fn combine(&self, other: &Vells, f: impl Fn(f64, f64) -> f64) -> Result<Vells, NodeError> {
        match (self, other) {
            (Vells::Scalar(a), Vells::Scalar(b)) => Ok(Vells::Scalar(f(*a, *b))),
            (Vells::Scalar(a), Vells::Array { shape, data }) => Ok(Vells::Array {
                shape: shape.clone(),
                data: Arc::new(data.iter().map(|b| f(*a, *b)).collect()),
            }),
            (Vells::Array { shape, data }, Vells::Scalar(b)) => Ok(Vells::Array {
                shape: shape.clone(),
                data: Arc::new(data.iter().map(|a| f(*a, *b)).collect()),
            }),
            (Vells::Array { shape: sa, data: da }, Vells::Array { shape: sb, data: db }) => {
                if sa != sb {
                    return Err(NodeError::ShapeMismatch(format!("{:?} vs {:?}", sa, sb)));
                }
                Ok(Vells::Array {
                    shape: sa.clone(),
                    data: Arc::new(da.iter().zip(db.iter()).map(|(a, b)| f(*a, *b)).collect()),
                })
            }
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Vells {
        match self {
            Vells::Scalar(v) => Vells::Scalar(f(*v)),
            Vells::Array { shape, data } => Vells::Array {
                shape: shape.clone(),
                data: Arc::new(data.iter().map(|v| f(*v)).collect()),
            },
        }
    }

    /// Averages blocks of cells down to `target`. Every axis must shrink by
    /// an integer factor.
    pub fn integrate(&self, target: &[usize]) -> Result<Vells, NodeError> {
        let (shape, data) = match self {
            Vells::Scalar(_) => return Ok(self.clone()),
            Vells::Array { shape, data } => (shape, data),
        };
        let factors = block_factors(shape, target)?;
        let block: usize = factors.iter().product();
        let mut out = vec![0.0; target.iter().product()];
        for (src, value) in data.iter().enumerate() {
            let coords = unravel(src, shape);
            let dst: Vec<usize> = coords.iter().zip(&factors).map(|(c, f)| c / f).collect();
            out[ravel(&dst, target)] += value / block as f64;
        }
        Vells::array(target.to_vec(), out)
    }

    /// Repeats each cell up to `target`. Every axis must grow by an integer
    /// factor.
    pub fn upsample(&self, target: &[usize]) -> Result<Vells, NodeError> {
        let (shape, data) = match self {
            Vells::Scalar(_) => return Ok(self.clone()),
            Vells::Array { shape, data } => (shape, data),
        };
        let factors = block_factors(target, shape)?;
        let total: usize = target.iter().product();
        let out = (0..total)
            .map(|dst| {
                let coords = unravel(dst, target);
                let src: Vec<usize> = coords.iter().zip(&factors).map(|(c, f)| c / f).collect();
                data[ravel(&src, shape)]
            })
            .collect();
        Vells::array(target.to_vec(), out)
    }
}

impl From<f64> for Vells {
    fn from(v: f64) -> Self {
        Vells::Scalar(v)
    }
}

fn block_factors(fine: &[usize], coarse: &[usize]) -> Result<Vec<usize>, NodeError> {
    if fine.len() != coarse.len() {
        return Err(NodeError::ShapeMismatch(format!("{:?} vs {:?}", fine, coarse)));
    }
    fine.iter()
        .zip(coarse)
        .map(|(&f, &c)| {
            if c == 0 || f % c != 0 {
                Err(NodeError::ShapeMismatch(format!(
                    "cannot resample {:?} to {:?}: not an integer factor",
                    fine, coarse
                )))
            } else {
                Ok(f / c)
            }
        })
        .collect()
}

fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for (i, &n) in shape.iter().enumerate().rev() {
        coords[i] = index % n;
        index /= n;
    }
    coords
}

fn ravel(coords: &[usize], shape: &[usize]) -> usize {
    coords
        .iter()
        .zip(shape)
        .fold(0, |acc, (&c, &n)| acc * n + c)
}
