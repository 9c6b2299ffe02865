use briny_dnn::desc::{Algorithm, ConvolutionDesc, OpDesc, PaddingKind, PropKind, Window};
use briny_dnn::*;

const BATCH: usize = 2;

fn seeded(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 1637) as f32).collect()
}

fn user_memory(
    rt: &mut Runtime,
    engine: Handle<Engine>,
    dims: &[i64],
    format: Format,
    data: &mut [f32],
) -> Result<Handle<Primitive>> {
    let md = MemoryDesc::new(dims, DataType::F32, format)?;
    let pd = rt.memory_primitive_desc_create(&md, engine)?;
    let mem = rt.memory_primitive_create(pd)?;
    // SAFETY: every buffer outlives the runtime in `main`.
    unsafe { rt.memory_set_data_handle(mem, data.as_mut_ptr().cast(), data.len() * 4)? };
    rt.primitive_desc_destroy(pd)?;
    Ok(mem)
}

fn main() -> Result<()> {
    let mut src = seeded(BATCH * 3 * 227 * 227);
    let mut weights = seeded(96 * 3 * 11 * 11);
    let mut bias = seeded(96);
    let mut dst = vec![0.0f32; BATCH * 96 * 55 * 55];
    let b = BATCH as i64;

    let mut rt = Runtime::new();
    let engine = rt.engine_create(default_engine_kind(), 0)?;
    println!("engine: {:?}", rt.engine_kind(engine)?);

    let any = |dims: &[i64]| MemoryDesc::new(dims, DataType::F32, Format::Any);
    let conv = ConvolutionDesc::forward(
        PropKind::Forward,
        Algorithm::ConvolutionDirect,
        &any(&[b, 3, 227, 227])?,
        &any(&[96, 3, 11, 11])?,
        Some(&MemoryDesc::new(&[96], DataType::F32, Format::X)?),
        &any(&[b, 96, 55, 55])?,
        Window::new(&[4, 4], &[0, 0], &[0, 0], PaddingKind::Zero)?,
    )?;
    let conv_pd = rt.primitive_desc_create(&OpDesc::Convolution(conv), engine, None)?;

    let src_mem = user_memory(&mut rt, engine, &[b, 3, 227, 227], Format::Nchw, &mut src)?;
    let weights_mem = user_memory(&mut rt, engine, &[96, 3, 11, 11], Format::Oihw, &mut weights)?;
    let bias_mem = user_memory(&mut rt, engine, &[96], Format::X, &mut bias)?;
    let dst_mem = user_memory(&mut rt, engine, &[b, 96, 55, 55], Format::Nchw, &mut dst)?;

    let mut net = Vec::new();
    let mut inputs = Vec::new();
    for (user, kind, index) in [
        (src_mem, QueryKind::Src, 0),
        (weights_mem, QueryKind::Weights, 0),
        (bias_mem, QueryKind::Weights, 1),
    ] {
        let Some(target) = rt.primitive_desc_query_pd(conv_pd, kind, index)? else {
            continue;
        };
        match rt.prepare_reorder(user, target, ReorderDirection::UserToPrimitive)? {
            Some(plan) => {
                net.push(plan.reorder);
                inputs.push(PrimitiveAt::new(plan.memory));
            }
            None => inputs.push(PrimitiveAt::new(user)),
        }
    }

    let Some(dst_pd) = rt.primitive_desc_query_pd(conv_pd, QueryKind::Dst, 0)? else {
        return Err(DnnError::InvalidState("convolution has no destination".into()));
    };
    let chosen = rt.primitive_desc_query_memory(conv_pd, QueryKind::Dst, 0)?;
    println!("backend destination layout: {:?}", chosen.map(|md| md.format()));
    match rt.prepare_reorder(dst_mem, dst_pd, ReorderDirection::PrimitiveToUser)? {
        Some(plan) => {
            net.push(rt.primitive_create(conv_pd, &inputs, &[plan.memory])?);
            net.push(plan.reorder);
        }
        None => net.push(rt.primitive_create(conv_pd, &inputs, &[dst_mem])?),
    }

    let stream = rt.stream_create(StreamKind::Eager);
    rt.stream_submit(stream, &net)?;
    rt.stream_wait(stream)?;
    println!("{} primitives ran, dst[0] = {}", net.len(), dst[0]);
    Ok(())
}
