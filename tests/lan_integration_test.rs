//! Integration tests for building LAN likelihoods from interchange graphs and
//! wrapping them as symbolic ops.

use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Tensor, backend::Backend};
use hssm_lan::graph::{Attribute, GraphConfig, INPUT_NAME, Initializer, InterchangeGraph, Node, interpret};
use hssm_lan::layers::Activation;
use hssm_lan::likelihood::{FunctionCache, LanConfig, LanFunctions, ParamValue, build_likelihood};
use hssm_lan::symbolic::{DType, DispatchRegistry, Function, Op, Value, Variable, apply, grad, lower, mul};
use hssm_lan::{LanError, ModelSource, make_logp_funcs, make_logp_ops};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type TestBackend = Autodiff<NdArray<f64>>;

const TOLERANCE: f64 = 1e-5;

fn floats_close(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
}

/// A small ddm-shaped network: 6 inputs -> 8 tanh -> 1.
fn tanh_network(seed: u64) -> InterchangeGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    let hidden: Vec<Vec<f64>> = (0..8)
        .map(|_| (0..6).map(|_| rng.gen_range(-0.5..0.5)).collect())
        .collect();
    let hidden_bias: Vec<f64> = (0..8).map(|_| rng.gen_range(-0.1..0.1)).collect();
    let output: Vec<f64> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();

    GraphConfig::with_feature_size(6)
        .name("ddm_lan")
        .dense(hidden, hidden_bias, Activation::Tanh)
        .dense(vec![output], vec![-0.3], Activation::None)
        .build()
        .expect("Graph build should succeed")
}

fn signed_rts(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n)
        .map(|_| {
            let rt: f64 = rng.gen_range(0.2..2.5);
            if rng.gen_bool(0.6) { rt } else { -rt }
        })
        .collect()
}

fn random_params(rng: &mut StdRng) -> Vec<ParamValue> {
    vec![
        ParamValue::Scalar(rng.gen_range(-2.0..2.0)),
        ParamValue::Scalar(rng.gen_range(0.5..2.0)),
        ParamValue::Scalar(rng.gen_range(0.3..0.7)),
        ParamValue::Scalar(rng.gen_range(0.1..0.5)),
    ]
}

fn build(graph: impl Into<ModelSource>, compile: bool) -> LanFunctions {
    make_logp_funcs(graph, 4, compile).expect("Likelihood build should succeed")
}

#[test]
fn test_compiled_and_nojit_agree() {
    let funcs = build(tanh_network(1), true);
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..10 {
        let data = signed_rts(&mut rng, 50);
        let params = random_params(&mut rng);
        let compiled = funcs.forward().logp(&data, &params).unwrap();
        let nojit = funcs.forward_nojit().logp(&data, &params).unwrap();
        assert!(
            floats_close(compiled, nojit, TOLERANCE),
            "compiled {compiled} != nojit {nojit}"
        );
    }
}

#[test]
fn test_gradient_matches_finite_differences() {
    let funcs = build(tanh_network(2), true);
    let mut rng = StdRng::seed_from_u64(23);
    let eps = 1e-5;

    for _ in 0..20 {
        let data = signed_rts(&mut rng, 30);
        let params = random_params(&mut rng);
        let grads = funcs.grad().grad_logp(&data, &params).unwrap();
        assert_eq!(grads.len(), 4);

        for (i, analytic) in grads.iter().enumerate() {
            let ParamValue::Scalar(analytic) = *analytic else {
                panic!("scalar parameter {i} must have a scalar gradient");
            };
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[i] = ParamValue::Scalar(params[i].values()[0] + eps);
            minus[i] = ParamValue::Scalar(params[i].values()[0] - eps);
            let numeric = (funcs.forward().logp(&data, &plus).unwrap()
                - funcs.forward().logp(&data, &minus).unwrap())
                / (2.0 * eps);
            assert!(
                floats_close(analytic, numeric, 1e-4),
                "parameter {i}: analytic {analytic} vs numeric {numeric}"
            );
        }
    }
}

#[test]
fn test_batched_gradient_matches_scalar_sum() {
    let funcs = build(tanh_network(3), false);
    let data = [0.7, -1.1, 0.45, 2.0];
    let scalar = [
        ParamValue::Scalar(0.5),
        ParamValue::Scalar(1.2),
        ParamValue::Scalar(0.5),
        ParamValue::Scalar(0.3),
    ];
    let mut batched = scalar.to_vec();
    batched[0] = ParamValue::Batched(vec![0.5; 4]);

    let scalar_grads = funcs.grad().grad_logp(&data, &scalar).unwrap();
    let batched_grads = funcs.grad().grad_logp(&data, &batched).unwrap();

    let ParamValue::Batched(per_trial) = &batched_grads[0] else {
        panic!("batched parameter must have a batched gradient");
    };
    assert_eq!(per_trial.len(), 4);
    let total: f64 = per_trial.iter().sum();
    assert!(floats_close(total, scalar_grads[0].values()[0], 1e-10));
    assert_eq!(scalar_grads[1], batched_grads[1]);
}

#[test]
fn test_parameter_arity_enforced() {
    let funcs = build(tanh_network(4), true);
    let data = [0.5, -0.5];

    let too_few = vec![ParamValue::Scalar(1.0); 3];
    let too_many = vec![ParamValue::Scalar(1.0); 5];

    for params in [&too_few, &too_many] {
        let err = funcs.forward().logp(&data, params).unwrap_err();
        assert!(matches!(err, LanError::ParameterArity { expected: 4, .. }));
        let err = funcs.forward_nojit().logp(&data, params).unwrap_err();
        assert!(matches!(err, LanError::ParameterArity { expected: 4, .. }));
        let err = funcs.grad().grad_logp(&data, params).unwrap_err();
        assert!(matches!(err, LanError::ParameterArity { expected: 4, .. }));
    }

    let mut registry = DispatchRegistry::new();
    let op = make_logp_ops(Arc::new(funcs), &mut registry);
    let err = op
        .call(Variable::vector("data"), vec![1.0.into(), 2.0.into(), 3.0.into()])
        .unwrap_err();
    assert!(matches!(err, LanError::ParameterArity { expected: 4, actual: 3 }));
}

/// input -> Gemm -> Conv -> Tanh
fn graph_with_unsupported_node() -> InterchangeGraph {
    let nodes = vec![
        Node::new(
            "Gemm_0",
            "Gemm",
            vec![INPUT_NAME.to_string(), "w".to_string(), "b".to_string()],
            vec!["dense_0".to_string()],
        )
        .with_attribute("transB", Attribute::Int(1)),
        Node::new("conv_1", "Conv", vec!["dense_0".to_string()], vec!["conv_out".to_string()]),
        Node::new("Tanh_2", "Tanh", vec!["conv_out".to_string()], vec!["out".to_string()]),
    ];
    let initializers = vec![
        Initializer::new("w", vec![1, 6], vec![0.1; 6]).unwrap(),
        Initializer::new("b", vec![1], vec![0.0]).unwrap(),
    ];
    InterchangeGraph::new("bad", INPUT_NAME, Some(6), nodes, initializers, "out")
        .expect("Structure is a valid DAG")
}

#[test]
fn test_unsupported_operator_names_node() {
    let graph = Arc::new(graph_with_unsupported_node());

    for compile in [true, false] {
        let device = Default::default();
        let err = build_likelihood::<TestBackend>(
            Arc::clone(&graph),
            4,
            &LanConfig::new().compile(compile),
            &device,
        )
        .unwrap_err();
        match err {
            LanError::UnsupportedOperator { node, op_type } => {
                assert_eq!(node, "conv_1");
                assert_eq!(op_type, "Conv");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // Nothing runs before the whole graph is accepted.
    let device = Default::default();
    let input = Tensor::<NdArray<f64>, 2>::zeros([2, 6], &device);
    let err = interpret(&graph, input).unwrap_err();
    assert!(matches!(err, LanError::UnsupportedOperator { ref node, .. } if node == "conv_1"));
}

#[test]
fn test_chain_rule_scaling_is_exact() {
    let funcs = Arc::new(build(tanh_network(5), true));
    let mut registry = DispatchRegistry::new();
    let op = make_logp_ops(Arc::clone(&funcs), &mut registry);

    let data = Variable::vector("data");
    let [v, a, z, t] = ["v", "a", "z", "t"].map(Variable::scalar);
    let params = vec![(&v).into(), (&a).into(), (&z).into(), (&t).into()];
    let logp = op.call(&data, params.clone()).unwrap();
    let y = mul(2.0, &logp).unwrap();
    let dy_dv = grad(&y, std::slice::from_ref(&v)).unwrap().remove(0);

    let grad_op: Arc<dyn Op> = Arc::clone(op.grad_op()) as Arc<dyn Op>;
    let mut grad_inputs = vec![(&data).into()];
    grad_inputs.extend(params);
    let grad_v = apply(grad_op, grad_inputs).unwrap().output(0).unwrap();

    let inputs = vec![data, v, a, z, t];
    let f = Function::new(inputs, vec![dy_dv, grad_v]).unwrap();
    let out = f
        .call(&[
            Value::vector(vec![0.8, -0.6, 1.3]),
            Value::scalar(0.9),
            Value::scalar(1.4),
            Value::scalar(0.5),
            Value::scalar(0.25),
        ])
        .unwrap();

    let dy_dv = out[0].as_scalar().unwrap();
    let grad_v = out[1].as_scalar().unwrap();
    assert_eq!(dy_dv, 2.0 * grad_v);
}

#[test]
fn test_end_to_end_affine_network() {
    let weights = [0.4, -0.7, 1.1, 0.25, -2.0, 0.6];
    let bias = -0.15;
    let graph = GraphConfig::with_feature_size(6)
        .dense(vec![weights.to_vec()], vec![bias], Activation::None)
        .build()
        .unwrap();
    let funcs = build(graph, true);

    let mut rng = StdRng::seed_from_u64(42);
    let data = signed_rts(&mut rng, 100);
    let params = [1.3, 0.9, 0.45, 0.2];
    let param_values: Vec<ParamValue> = params.iter().copied().map(ParamValue::from).collect();

    let expected: f64 = data
        .iter()
        .map(|&x| {
            let choice = if x > 0.0 { 1.0 } else { 0.0 };
            let row = [params[0], params[1], params[2], params[3], x.abs(), choice];
            row.iter().zip(&weights).map(|(r, w)| r * w).sum::<f64>() + bias
        })
        .sum();

    let compiled = funcs.forward().logp(&data, &param_values).unwrap();
    let nojit = funcs.forward_nojit().logp(&data, &param_values).unwrap();
    assert!(floats_close(compiled, expected, 1e-10), "{compiled} != {expected}");
    assert!(floats_close(nojit, expected, 1e-10), "{nojit} != {expected}");

    // Linear in the parameters, so the gradient is the weight times the row count.
    let grads = funcs.grad().grad_logp(&data, &param_values).unwrap();
    for (g, w) in grads.iter().zip(&weights) {
        assert!(floats_close(g.values()[0], w * 100.0, 1e-10));
    }
}

#[test]
fn test_lowering_uses_registered_nojit_kernel() {
    let funcs = Arc::new(build(tanh_network(6), true));
    let mut registry = DispatchRegistry::new();
    let op = make_logp_ops(Arc::clone(&funcs), &mut registry);

    let data = Variable::vector("data");
    let v = Variable::scalar("v");
    let logp = op
        .call(&data, vec![(&v).into(), 1.0.into(), 0.5.into(), 0.3.into()])
        .unwrap();

    let lowered = lower(vec![data.clone(), v.clone()], vec![logp.clone()], &registry).unwrap();
    assert_eq!(lowered.num_steps(), 1);

    let rts = vec![0.9, -1.4, 0.35];
    let out = lowered
        .call(&[Value::vector(rts.clone()), Value::scalar(0.7)])
        .unwrap();
    let params: Vec<ParamValue> = vec![0.7.into(), 1.0.into(), 0.5.into(), 0.3.into()];
    let expected = funcs.forward_nojit().logp(&rts, &params).unwrap();
    assert_eq!(out[0].as_scalar(), Some(expected));

    let err = lower(vec![data, v], vec![logp], &DispatchRegistry::new()).unwrap_err();
    assert!(matches!(err, LanError::MissingDispatch { ref op, .. } if op == "lan_logp"));
}

#[test]
fn test_second_order_gradient_fails() {
    let funcs = Arc::new(build(tanh_network(7), true));
    let mut registry = DispatchRegistry::new();
    let op = make_logp_ops(funcs, &mut registry);

    let data = Variable::vector("data");
    let v = Variable::scalar("v");
    let logp = op
        .call(&data, vec![(&v).into(), 1.0.into(), 0.5.into(), 0.3.into()])
        .unwrap();
    let dv = grad(&logp, std::slice::from_ref(&v)).unwrap().remove(0);

    let err = grad(&dv, &[v]).unwrap_err();
    assert!(matches!(
        err,
        LanError::GradientNotImplemented { ref op, .. } if op == "lan_logp_grad"
    ));
}

#[test]
fn test_json_and_binary_round_trip_and_file_load() {
    let graph = tanh_network(8);
    let json = graph.to_json().unwrap();
    let graph_bytes = graph.to_onnx();

    let from_json = ModelSource::Json(json.clone()).load().unwrap();
    assert_eq!(from_json.nodes(), graph.nodes());
    assert_eq!(from_json.initializers(), graph.initializers());
    assert_eq!(from_json.input_width(), Some(6));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ddm_lan.onnx.json");
    std::fs::write(&path, &json).unwrap();

    let from_file = build(path.as_path(), true);
    let in_memory = build(graph, true);
    let data = [0.6, -0.9, 1.7];
    let params: Vec<ParamValue> = vec![0.2.into(), 1.1.into(), 0.5.into(), 0.35.into()];
    assert_eq!(
        from_file.forward().logp(&data, &params).unwrap(),
        in_memory.forward().logp(&data, &params).unwrap()
    );

    let binary = dir.path().join("ddm_lan.onnx");
    std::fs::write(&binary, graph_bytes).unwrap();
    let from_binary = ModelSource::from(binary.as_path()).load().unwrap();
    assert_eq!(from_binary.nodes(), from_json.nodes());
    assert_eq!(from_binary.initializers(), from_json.initializers());
    assert_eq!(from_binary.input_width(), Some(6));

    let binary_funcs = build(binary.as_path(), true);
    assert_eq!(
        binary_funcs.forward().logp(&data, &params).unwrap(),
        from_file.forward().logp(&data, &params).unwrap()
    );

    let truncated = dir.path().join("truncated.onnx");
    std::fs::write(&truncated, &from_binary.to_onnx()[..40]).unwrap();
    let err = make_logp_funcs(truncated.as_path(), 4, true).unwrap_err();
    assert!(matches!(err, LanError::ModelLoad { .. }));
}

#[test]
fn test_cache_reuses_functions() {
    let graph = Arc::new(tanh_network(9));
    let cache = FunctionCache::new(LanConfig::new().output_dtype(DType::Float32));
    let device = <TestBackend as Backend>::Device::default();

    let first = cache
        .get_or_build::<TestBackend>(Arc::clone(&graph), 4, true, &device)
        .unwrap();
    let second = cache
        .get_or_build::<TestBackend>(Arc::clone(&graph), 4, true, &device)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.output_dtype(), DType::Float32);

    let uncompiled = cache
        .get_or_build::<TestBackend>(Arc::clone(&graph), 4, false, &device)
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &uncompiled));
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert!(cache.is_empty());
}
