use briny_dnn::desc::{
    Algorithm, ConvolutionDesc, EltwiseDesc, OpDesc, PaddingKind, PoolingDesc, PropKind, Window,
};
use briny_dnn::ops::cpu;
use briny_dnn::*;

const SRC: [i64; 4] = [2, 8, 6, 6];
const WEIGHTS: [i64; 4] = [8, 8, 3, 3];
const POOLED: [i64; 4] = [2, 8, 3, 3];

fn any(dims: &[i64]) -> MemoryDesc {
    MemoryDesc::new(dims, DataType::F32, Format::Any).unwrap()
}

fn plain(dims: &[i64], format: Format) -> MemoryDesc {
    MemoryDesc::new(dims, DataType::F32, format).unwrap()
}

fn len(dims: &[i64]) -> usize {
    dims.iter().product::<i64>() as usize
}

fn user_memory(rt: &mut Runtime, engine: Handle<Engine>, md: &MemoryDesc, data: &mut [f32]) -> Handle<Primitive> {
    let pd = rt.memory_primitive_desc_create(md, engine).unwrap();
    let mem = rt.memory_primitive_create(pd).unwrap();
    unsafe {
        rt.memory_set_data_handle(mem, data.as_mut_ptr().cast(), data.len() * 4)
            .unwrap();
    }
    mem
}

/// Runtime-owned memory in the layout `pd` wants for a slot.
fn scratch(rt: &mut Runtime, pd: Handle<PrimitiveDesc>, kind: QueryKind, index: usize) -> Handle<Primitive> {
    let slot = rt.primitive_desc_query_pd(pd, kind, index).unwrap().unwrap();
    let mem = rt.memory_primitive_create(slot).unwrap();
    rt.memory_allocate(mem).unwrap();
    mem
}

/// Memory to bind for a slot fed from `user`, with any reorder appended to `net`.
fn feed(
    rt: &mut Runtime,
    user: Handle<Primitive>,
    pd: Handle<PrimitiveDesc>,
    kind: QueryKind,
    net: &mut Vec<Handle<Primitive>>,
) -> Handle<Primitive> {
    let slot = rt.primitive_desc_query_pd(pd, kind, 0).unwrap().unwrap();
    match rt.prepare_reorder(user, slot, ReorderDirection::UserToPrimitive).unwrap() {
        Some(plan) => {
            net.push(plan.reorder);
            plan.memory
        }
        None => user,
    }
}

/// Memory to bind for a slot drained into `user`, plus the reorder to run afterwards.
fn drain(
    rt: &mut Runtime,
    user: Handle<Primitive>,
    pd: Handle<PrimitiveDesc>,
    kind: QueryKind,
    index: usize,
) -> (Handle<Primitive>, Option<Handle<Primitive>>) {
    let slot = rt.primitive_desc_query_pd(pd, kind, index).unwrap().unwrap();
    match rt.prepare_reorder(user, slot, ReorderDirection::PrimitiveToUser).unwrap() {
        Some(plan) => (plan.memory, Some(plan.reorder)),
        None => (user, None),
    }
}

#[test]
fn test_training_step_through_blocked_layouts_matches_plain_kernels() {
    let mut src: Vec<f32> = (0..len(&SRC)).map(|i| ((i * 13) % 17) as f32 / 17.0).collect();
    let mut weights: Vec<f32> = (0..len(&WEIGHTS)).map(|i| ((i * 7) % 11) as f32 / 22.0).collect();
    let mut bias: Vec<f32> = (0..8).map(|i| i as f32 / 8.0).collect();
    let mut pooled = vec![0.0f32; len(&POOLED)];
    let mut diff_pooled = vec![1.0f32; len(&POOLED)];
    let mut diff_src = vec![0.0f32; len(&SRC)];
    let mut diff_weights = vec![0.0f32; len(&WEIGHTS)];
    let mut diff_bias = vec![0.0f32; 8];

    let mut rt = Runtime::new();
    let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
    let same = Window::new(&[1, 1], &[1, 1], &[1, 1], PaddingKind::Zero).unwrap();
    let halve = Window::new(&[2, 2], &[0, 0], &[0, 0], PaddingKind::Zero).unwrap();
    let bias_md = plain(&[8], Format::X);

    // forward: conv -> relu -> max pool
    let conv = ConvolutionDesc::forward(
        PropKind::Forward,
        Algorithm::ConvolutionDirect,
        &any(&SRC),
        &any(&WEIGHTS),
        Some(&bias_md),
        &any(&SRC),
        same,
    )
    .unwrap();
    let conv_pd = rt
        .primitive_desc_create(&OpDesc::Convolution(conv.clone()), engine, None)
        .unwrap();
    let conv_dst_md = rt
        .primitive_desc_query_memory(conv_pd, QueryKind::Dst, 0)
        .unwrap()
        .unwrap();
    assert_eq!(conv_dst_md.format(), Format::NChw8c);
    let relu_pd = rt
        .primitive_desc_create(
            &OpDesc::Eltwise(
                EltwiseDesc::forward(PropKind::Forward, Algorithm::EltwiseRelu, &conv_dst_md, 0.0)
                    .unwrap(),
            ),
            engine,
            None,
        )
        .unwrap();
    let pool = PoolingDesc::forward(
        PropKind::Forward,
        Algorithm::PoolingMax,
        &conv_dst_md,
        &any(&POOLED),
        &[2, 2],
        halve,
    )
    .unwrap();
    let pool_pd = rt
        .primitive_desc_create(&OpDesc::Pooling(pool.clone()), engine, None)
        .unwrap();
    let ws_md = rt
        .primitive_desc_query_memory(pool_pd, QueryKind::Workspace, 0)
        .unwrap()
        .unwrap();
    assert_eq!(ws_md.data_type(), DataType::S32);

    let mut forward = Vec::new();
    let src_user = user_memory(&mut rt, engine, &plain(&SRC, Format::Nchw), &mut src);
    let weights_user = user_memory(&mut rt, engine, &plain(&WEIGHTS, Format::Oihw), &mut weights);
    let bias_user = user_memory(&mut rt, engine, &bias_md, &mut bias);
    let src_mem = feed(&mut rt, src_user, conv_pd, QueryKind::Src, &mut forward);
    let weights_mem = feed(&mut rt, weights_user, conv_pd, QueryKind::Weights, &mut forward);
    assert_eq!(forward.len(), 2, "both src and weights are blocked");
    let conv_dst = scratch(&mut rt, conv_pd, QueryKind::Dst, 0);
    forward.push(
        rt.primitive_create(
            conv_pd,
            &[src_mem.into(), weights_mem.into(), bias_user.into()],
            &[conv_dst],
        )
        .unwrap(),
    );
    let relu_dst = scratch(&mut rt, relu_pd, QueryKind::Dst, 0);
    let relu = rt.primitive_create(relu_pd, &[conv_dst.into()], &[relu_dst]).unwrap();
    forward.push(relu);
    let pooled_user = user_memory(&mut rt, engine, &plain(&POOLED, Format::Nchw), &mut pooled);
    let (pool_dst, pool_out) = drain(&mut rt, pooled_user, pool_pd, QueryKind::Dst, 0);
    let workspace = scratch(&mut rt, pool_pd, QueryKind::Workspace, 0);
    forward.push(
        rt.primitive_create(pool_pd, &[PrimitiveAt::new(relu)], &[pool_dst, workspace])
            .unwrap(),
    );
    forward.extend(pool_out);

    // backward: max pool -> relu -> conv data and weights
    let pool_bwd_pd = rt
        .primitive_desc_create(
            &OpDesc::Pooling(
                PoolingDesc::backward(Algorithm::PoolingMax, &any(&SRC), &any(&POOLED), &[2, 2], halve)
                    .unwrap(),
            ),
            engine,
            Some(pool_pd),
        )
        .unwrap();
    let relu_bwd_pd = rt
        .primitive_desc_create(
            &OpDesc::Eltwise(
                EltwiseDesc::backward(Algorithm::EltwiseRelu, &any(&SRC), &conv_dst_md, 0.0).unwrap(),
            ),
            engine,
            Some(relu_pd),
        )
        .unwrap();
    let bwd_data_pd = rt
        .primitive_desc_create(
            &OpDesc::Convolution(
                ConvolutionDesc::backward_data(
                    Algorithm::ConvolutionDirect,
                    &any(&SRC),
                    &any(&WEIGHTS),
                    &any(&SRC),
                    same,
                )
                .unwrap(),
            ),
            engine,
            Some(conv_pd),
        )
        .unwrap();
    let bwd_weights_pd = rt
        .primitive_desc_create(
            &OpDesc::Convolution(
                ConvolutionDesc::backward_weights(
                    Algorithm::ConvolutionDirect,
                    &any(&SRC),
                    &any(&WEIGHTS),
                    Some(&bias_md),
                    &any(&SRC),
                    same,
                )
                .unwrap(),
            ),
            engine,
            Some(conv_pd),
        )
        .unwrap();

    let mut backward = Vec::new();
    let diff_pooled_user = user_memory(&mut rt, engine, &plain(&POOLED, Format::Nchw), &mut diff_pooled);
    let diff_pool_dst = feed(&mut rt, diff_pooled_user, pool_bwd_pd, QueryKind::DiffDst, &mut backward);
    let diff_relu = scratch(&mut rt, pool_bwd_pd, QueryKind::DiffSrc, 0);
    backward.push(
        rt.primitive_create(pool_bwd_pd, &[diff_pool_dst.into(), workspace.into()], &[diff_relu])
            .unwrap(),
    );
    let diff_conv = scratch(&mut rt, relu_bwd_pd, QueryKind::DiffSrc, 0);
    backward.push(
        rt.primitive_create(relu_bwd_pd, &[conv_dst.into(), diff_relu.into()], &[diff_conv])
            .unwrap(),
    );
    let diff_src_user = user_memory(&mut rt, engine, &plain(&SRC, Format::Nchw), &mut diff_src);
    let (diff_src_mem, diff_src_out) = drain(&mut rt, diff_src_user, bwd_data_pd, QueryKind::DiffSrc, 0);
    backward.push(
        rt.primitive_create(bwd_data_pd, &[diff_conv.into(), weights_mem.into()], &[diff_src_mem])
            .unwrap(),
    );
    backward.extend(diff_src_out);
    let diff_weights_user =
        user_memory(&mut rt, engine, &plain(&WEIGHTS, Format::Oihw), &mut diff_weights);
    let diff_bias_user = user_memory(&mut rt, engine, &bias_md, &mut diff_bias);
    let (diff_weights_mem, diff_weights_out) =
        drain(&mut rt, diff_weights_user, bwd_weights_pd, QueryKind::DiffWeights, 0);
    let (diff_bias_mem, diff_bias_out) =
        drain(&mut rt, diff_bias_user, bwd_weights_pd, QueryKind::DiffWeights, 1);
    assert!(diff_bias_out.is_none());
    backward.push(
        rt.primitive_create(
            bwd_weights_pd,
            &[src_mem.into(), diff_conv.into()],
            &[diff_weights_mem, diff_bias_mem],
        )
        .unwrap(),
    );
    backward.extend(diff_weights_out);

    let stream = rt.stream_create(StreamKind::Eager);
    rt.stream_submit(stream, &forward).unwrap();
    rt.stream_wait(stream).unwrap();
    let stream = rt.stream_create(StreamKind::Lazy);
    rt.stream_submit(stream, &backward).unwrap();
    rt.stream_wait(stream).unwrap();

    // the same step on plain buffers, straight through the kernels
    let conv_out = cpu::conv_forward(&conv, &src, &weights, Some(bias.as_slice()));
    let activated = cpu::relu_forward(&conv_out, 0.0);
    let (expected_pooled, argmax) = cpu::pool_forward(&pool, &activated);
    let expected_diff_relu = cpu::pool_backward(&pool, &diff_pooled, Some(argmax.as_slice()));
    let expected_diff_conv = cpu::relu_backward(&conv_out, &expected_diff_relu, 0.0);
    let expected_diff_src = cpu::conv_backward_data(&conv, &expected_diff_conv, &weights);
    let (expected_diff_weights, expected_diff_bias) =
        cpu::conv_backward_weights(&conv, &src, &expected_diff_conv);

    assert_eq!(pooled, expected_pooled);
    assert_eq!(diff_src, expected_diff_src);
    assert_eq!(diff_weights, expected_diff_weights);
    assert_eq!(diff_bias, expected_diff_bias);
    // every window routes its unit gradient to one activated (positive) element
    assert!(diff_bias.iter().all(|&g| g == 18.0));
}

#[test]
fn test_reorder_converts_and_saturates() {
    let mut rt = Runtime::new();
    let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
    let from = rt
        .memory_primitive_desc_create(&plain(&[1, 2, 1, 2], Format::Nchw), engine)
        .unwrap();
    let to = rt
        .memory_primitive_desc_create(
            &MemoryDesc::new(&[1, 2, 1, 2], DataType::S8, Format::Nhwc).unwrap(),
            engine,
        )
        .unwrap();
    let reorder = rt.reorder_primitive_desc_create(from, to).unwrap();
    assert_eq!(rt.primitive_desc_kind(reorder).unwrap(), PrimitiveKind::Reorder);

    let mut input = vec![1.4f32, -200.0, 300.0, -2.6];
    let mut output = vec![0u8; 4];
    let src = rt.memory_primitive_create(from).unwrap();
    let dst = rt.memory_primitive_create(to).unwrap();
    unsafe {
        rt.memory_set_data_handle(src, input.as_mut_ptr().cast(), 16).unwrap();
        rt.memory_set_data_handle(dst, output.as_mut_ptr(), 4).unwrap();
    }
    let p = rt.primitive_create(reorder, &[src.into()], &[dst]).unwrap();
    let stream = rt.stream_create(StreamKind::Eager);
    rt.stream_submit(stream, &[p]).unwrap();
    rt.stream_wait(stream).unwrap();
    let as_i8: Vec<i8> = output.iter().map(|&b| b as i8).collect();
    // nhwc interleaves the two channels
    assert_eq!(as_i8, vec![1, 127, -128, -3]);

    let wrong = rt
        .memory_primitive_desc_create(&plain(&[1, 2, 2, 1], Format::Nchw), engine)
        .unwrap();
    assert!(matches!(
        rt.reorder_primitive_desc_create(from, wrong),
        Err(DnnError::ShapeMismatch(_))
    ));
}

fn encode(data_type: DataType, values: &[i64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| match data_type {
            DataType::S32 => (v as i32).to_ne_bytes().to_vec(),
            DataType::S16 => (v as i16).to_ne_bytes().to_vec(),
            DataType::S8 => vec![v as i8 as u8],
            other => panic!("no integer encoding for {other:?}"),
        })
        .collect()
}

#[test]
fn test_same_type_reorders_are_exact() {
    for (data_type, values) in [
        (
            DataType::S32,
            [16_777_217, 123_456_789, i64::from(i32::MIN), i64::from(i32::MAX)],
        ),
        (DataType::S16, [i64::from(i16::MIN), 12_345, -1, i64::from(i16::MAX)]),
        (DataType::S8, [-128, 127, -1, 5]),
    ] {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let nchw = MemoryDesc::new(&[1, 2, 1, 2], data_type, Format::Nchw).unwrap();
        let nhwc = MemoryDesc::new(&[1, 2, 1, 2], data_type, Format::Nhwc).unwrap();
        let user_pd = rt.memory_primitive_desc_create(&nchw, engine).unwrap();
        let target = rt.memory_primitive_desc_create(&nhwc, engine).unwrap();

        let mut input = encode(data_type, &values);
        let user = rt.memory_primitive_create(user_pd).unwrap();
        unsafe {
            rt.memory_set_data_handle(user, input.as_mut_ptr(), input.len()).unwrap();
        }
        let plan = rt
            .prepare_reorder(user, target, ReorderDirection::UserToPrimitive)
            .unwrap()
            .expect("nchw and nhwc differ on a 1x2 plane");
        let stream = rt.stream_create(StreamKind::Eager);
        rt.stream_submit(stream, &[plan.reorder]).unwrap();
        rt.stream_wait(stream).unwrap();

        let expected = encode(data_type, &[values[0], values[2], values[1], values[3]]);
        assert_eq!(rt.memory_bytes(plan.memory).unwrap(), &expected[..], "{data_type:?}");
    }
}
