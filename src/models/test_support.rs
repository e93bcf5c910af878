//! Small randomly initialized weight sets for model unit tests.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::generation::SamplingContext;

/// Run `build` once to register every weight, then fill all weights with
/// deterministic values in `[-0.2, 0.2)`. Building again from the returned
/// builder picks up the filled values.
///
/// Batch-norm variances are kept positive.
pub(crate) fn random_vb<F>(seed: u64, build: F) -> (VarMap, VarBuilder<'static>)
where
    F: FnOnce(VarBuilder<'static>) -> Result<()>,
{
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    build(vb.clone()).unwrap();

    let mut ctx = SamplingContext::new(Some(seed));
    {
        let data = varmap.data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            let var = &data[name];
            let values: Vec<f32> = (0..var.elem_count())
                .map(|_| {
                    let r = ctx.rand_f32();
                    if name.ends_with("running_var") {
                        0.5 + r
                    } else {
                        (r * 2.0 - 1.0) * 0.2
                    }
                })
                .collect();
            let t = Tensor::from_vec(values, var.shape(), &Device::Cpu).unwrap();
            var.set(&t).unwrap();
        }
    }

    (varmap, vb)
}
