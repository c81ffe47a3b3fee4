use meqcore::{Cells, NodeError, NodeResult, PerturbedSet, ResamplePolicy, ResultRef, Vells};
use std::sync::Arc;

/// Checks that the children's results lie on the request's domain and,
/// when their grids differ, resamples them to a common one according to
/// `policy`.
pub(super) fn reconcile(
    children: &mut [Option<ResultRef>],
    cells: &Cells,
    policy: ResamplePolicy,
) -> Result<(), NodeError> {
    let mut shapes: Vec<Vec<usize>> = Vec::new();
    for (i, child) in children.iter().enumerate() {
        let Some(child_cells) = child.as_ref().and_then(|r| r.cells.as_deref()) else {
            continue;
        };
        if !child_cells.same_domain(cells) {
            return Err(NodeError::CellsMismatch(format!(
                "child {} was computed on a different domain",
                i
            )));
        }
        let shape = child_cells.shape();
        if !shapes.contains(&shape) {
            shapes.push(shape);
        }
    }
    if shapes.len() < 2 {
        return Ok(());
    }

    let target = match policy {
        ResamplePolicy::None => return Ok(()),
        ResamplePolicy::Fail => {
            return Err(NodeError::CellsMismatch(format!(
                "children have different resolutions: {:?}",
                shapes
            )))
        }
        ResamplePolicy::Integrate => fold_shapes(&shapes, usize::min),
        ResamplePolicy::Upsample => fold_shapes(&shapes, usize::max),
    };
    let target_cells = Arc::new(cells.with_shape(&target));

    for child in children.iter_mut() {
        let Some(result) = child.as_ref() else {
            continue;
        };
        let on_target = result
            .cells
            .as_deref()
            .map_or(true, |c| c.shape() == target);
        if on_target {
            continue;
        }
        let resampled = resample(result, &target, policy)?.with_cells(Some(Arc::clone(&target_cells)));
        *child = Some(Arc::new(resampled));
    }
    Ok(())
}

fn fold_shapes(shapes: &[Vec<usize>], pick: fn(usize, usize) -> usize) -> Vec<usize> {
    let mut target = shapes[0].clone();
    for shape in &shapes[1..] {
        for (t, &n) in target.iter_mut().zip(shape) {
            *t = pick(*t, n);
        }
    }
    target
}

fn resample(result: &NodeResult, target: &[usize], policy: ResamplePolicy) -> Result<NodeResult, NodeError> {
    let apply = |v: &Vells| match policy {
        ResamplePolicy::Upsample => v.upsample(target),
        _ => v.integrate(target),
    };
    let mut out = result.clone();
    for vs in &mut out.vellsets {
        if let Some(value) = &vs.value {
            vs.value = Some(apply(value)?);
        }
        vs.perturbed_sets = vs
            .perturbed_sets
            .iter()
            .map(|set| {
                set.values
                    .iter()
                    .map(&apply)
                    .collect::<Result<Vec<_>, _>>()
                    .map(|values| PerturbedSet { values })
            })
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(out)
}
