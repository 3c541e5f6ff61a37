//! Matrix products split across scoped worker threads

use ndarray::{Array2, ArrayView2};

/// Below this many output elements a product runs on the calling thread.
const MIN_PARALLEL_OUTPUT: usize = 64 * 64;

/// Computes `a · b`. On wasm there are no threads, so this is just `dot`.
#[cfg(target_arch = "wasm32")]
pub(crate) fn dot(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>, _max_threads: usize) -> Array2<f32> {
    a.dot(&b)
}

/// Computes `a · b`, handing contiguous row blocks of `a` (and the matching
/// rows of the output) to at most `max_threads` workers.
#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn dot(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>, max_threads: usize) -> Array2<f32> {
    use ndarray::{linalg::general_mat_mul, Axis};

    let rows = a.nrows();
    let n_workers = max_threads.min(rows).max(1);

    if n_workers == 1 || rows * b.ncols() < MIN_PARALLEL_OUTPUT {
        return a.dot(&b);
    }

    let mut out = Array2::<f32>::zeros((rows, b.ncols()));
    let rows_per_worker = (rows + n_workers - 1) / n_workers;

    let result = crossbeam_utils::thread::scope(|scope| {
        for (a_block, mut out_block) in a
            .axis_chunks_iter(Axis(0), rows_per_worker)
            .zip(out.axis_chunks_iter_mut(Axis(0), rows_per_worker))
        {
            let b = &b;
            scope.spawn(move |_| general_mat_mul(1.0, &a_block, b, 0.0, &mut out_block));
        }
    });

    // a worker can only fail by panicking, so keep unwinding with its payload
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }

    out
}
