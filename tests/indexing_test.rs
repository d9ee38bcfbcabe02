use ndarray::{arr1, arr2, arr3, ArrayD, IxDyn};
use tensor_grad::{DType, SliceArg, Tensor, TensorError};

fn grid(rows: usize, cols: usize, requires_grad: bool) -> Tensor {
    let values = (0..rows * cols).map(|v| v as f32).collect();
    Tensor::from_vec(values, &[rows, cols], requires_grad).unwrap()
}

#[test]
fn test_slice_forward_and_scatter_backward() {
    let a = grid(3, 4, true);
    let s = a
        .slice(&[SliceArg::step(None, None, 2), SliceArg::range(1, 3)])
        .unwrap();
    assert_eq!(s.data(), &arr2(&[[1.0, 2.0], [9.0, 10.0]]).into_dyn());

    s.sum().unwrap().backward().unwrap();
    assert_eq!(
        a.grad().unwrap(),
        arr2(&[
            [0.0, 1.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0]
        ])
        .into_dyn()
    );
}

#[test]
fn test_slice_with_ranges_converted_from_std() {
    let a = grid(3, 4, false);
    let s = a.slice(&[SliceArg::from(1isize..), SliceArg::from(..-1isize)]).unwrap();
    assert_eq!(s.shape(), &[2, 3]);
    let row = a.slice(&[SliceArg::from(-1isize)]).unwrap();
    assert_eq!(row.data(), &arr1(&[8.0, 9.0, 10.0, 11.0]).into_dyn());
}

#[test]
fn test_slice_out_of_bounds_is_shape_error() {
    let a = grid(3, 4, false);
    assert!(matches!(a.slice(&[SliceArg::Index(3)]), Err(TensorError::Shape(_))));
    assert!(matches!(
        a.slice(&[SliceArg::Full, SliceArg::Full, SliceArg::Index(0)]),
        Err(TensorError::Shape(_))
    ));
    assert!(matches!(
        a.slice(&[SliceArg::step(None, None, 0)]),
        Err(TensorError::InvalidArgument(_))
    ));
}

#[test]
fn test_set_slice_is_functional() {
    let a = grid(2, 3, true);
    let v = Tensor::scalar(-1.0, true);
    let b = a.set_slice(&[SliceArg::Full, SliceArg::Index(1)], &v).unwrap();
    assert_eq!(b.data(), &arr2(&[[0.0, -1.0, 2.0], [3.0, -1.0, 5.0]]).into_dyn());
    // the source is untouched
    assert_eq!(a.data(), &arr2(&[[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]).into_dyn());

    b.sum().unwrap().backward().unwrap();
    assert_eq!(a.grad().unwrap(), arr2(&[[1.0, 0.0, 1.0], [1.0, 0.0, 1.0]]).into_dyn());
    // broadcast value collects the whole written region
    assert_eq!(v.grad().unwrap().sum(), 2.0);
}

#[test]
fn test_set_slice_chain_later_writes_shadow_earlier() {
    let base = Tensor::zeros(&[4], true);
    let first = Tensor::new(arr1(&[1.0, 1.0]).into_dyn(), true);
    let second = Tensor::new(arr1(&[2.0, 2.0]).into_dyn(), true);

    let x = base.set_slice(&[SliceArg::range(0, 2)], &first).unwrap();
    let y = x.set_slice(&[SliceArg::range(1, 3)], &second).unwrap();
    assert_eq!(y.data(), &arr1(&[1.0, 2.0, 2.0, 0.0]).into_dyn());

    let w = Tensor::new(arr1(&[10.0, 20.0, 30.0, 40.0]).into_dyn(), false);
    y.mul(&w).unwrap().sum().unwrap().backward().unwrap();

    assert_eq!(base.grad().unwrap(), arr1(&[0.0, 0.0, 0.0, 40.0]).into_dyn());
    // position 1 of `first` was overwritten by `second`
    assert_eq!(first.grad().unwrap(), arr1(&[10.0, 0.0]).into_dyn());
    assert_eq!(second.grad().unwrap(), arr1(&[20.0, 30.0]).into_dyn());
}

#[test]
fn test_set_slice_rejects_unbroadcastable_value() {
    let a = grid(2, 3, false);
    let v = Tensor::ones(&[4], false);
    assert!(matches!(
        a.set_slice(&[SliceArg::Index(0)], &v),
        Err(TensorError::Shape(_))
    ));
}

#[test]
fn test_index_select_duplicates_accumulate() {
    let a = grid(3, 2, true);
    let picked = a.index_select(0, &[2, 0, 2, 2]).unwrap();
    assert_eq!(
        picked.data(),
        &arr2(&[[4.0, 5.0], [0.0, 1.0], [4.0, 5.0], [4.0, 5.0]]).into_dyn()
    );
    picked.sum().unwrap().backward().unwrap();
    assert_eq!(a.grad().unwrap(), arr2(&[[1.0, 1.0], [0.0, 0.0], [3.0, 3.0]]).into_dyn());

    assert!(matches!(a.index_select(0, &[3]), Err(TensorError::Shape(_))));
}

#[test]
fn test_index_select_by_integral_tensor() {
    let a = grid(2, 3, false);
    let idx = Tensor::from_ints(vec![2, 0], &[2]).unwrap();
    let picked = a.index_select_by(-1, &idx).unwrap();
    assert_eq!(picked.data(), &arr2(&[[2.0, 0.0], [5.0, 3.0]]).into_dyn());

    let float_idx = Tensor::ones(&[2], false);
    assert!(matches!(a.index_select_by(0, &float_idx), Err(TensorError::Dtype(_))));
}

#[test]
fn test_index_select_by_table_lookup_shapes_and_accumulates() {
    let table = grid(3, 2, true);
    let ids = Tensor::from_ints(vec![2, 0, 2, 2], &[2, 2]).unwrap();
    let rows = table.index_select_by(0, &ids).unwrap();
    assert_eq!(rows.shape(), &[2, 2, 2]);
    assert_eq!(
        rows.data(),
        &arr3(&[[[4.0, 5.0], [0.0, 1.0]], [[4.0, 5.0], [4.0, 5.0]]]).into_dyn()
    );
    rows.sum().unwrap().backward().unwrap();
    assert_eq!(table.grad().unwrap(), arr2(&[[1.0, 1.0], [0.0, 0.0], [3.0, 3.0]]).into_dyn());

    let one = Tensor::from_ints(vec![1], &[]).unwrap();
    let row = table.index_select_by(0, &one).unwrap();
    assert_eq!(row.data(), &arr1(&[2.0, 3.0]).into_dyn());

    let bad = Tensor::from_ints(vec![0, 3], &[1, 2]).unwrap();
    assert!(matches!(table.index_select_by(0, &bad), Err(TensorError::Shape(_))));
    let negative = Tensor::from_ints(vec![-1], &[1]).unwrap();
    assert!(matches!(table.index_select_by(0, &negative), Err(TensorError::Shape(_))));
}

#[test]
fn test_masked_select_rows_and_cells() {
    let a = grid(3, 2, true);
    let keep_rows = Tensor::from_bools(vec![true, false, true], &[3]).unwrap();
    let rows = a.masked_select(&keep_rows).unwrap();
    assert_eq!(rows.data(), &arr2(&[[0.0, 1.0], [4.0, 5.0]]).into_dyn());

    let keep_cells = Tensor::from_bools(vec![false, true, true, false, false, true], &[3, 2]).unwrap();
    let cells = a.masked_select(&keep_cells).unwrap();
    assert_eq!(cells.data(), &arr1(&[1.0, 2.0, 5.0]).into_dyn());

    rows.sum().unwrap().add(&cells.sum().unwrap()).unwrap().backward().unwrap();
    assert_eq!(a.grad().unwrap(), arr2(&[[1.0, 2.0], [1.0, 0.0], [1.0, 2.0]]).into_dyn());

    let none = a.masked_select(&Tensor::from_bools(vec![false; 3], &[3]).unwrap()).unwrap();
    assert_eq!(none.shape(), &[0, 2]);

    let wrong_shape = Tensor::from_bools(vec![true, false], &[2]).unwrap();
    assert!(matches!(a.masked_select(&wrong_shape), Err(TensorError::Shape(_))));
    let not_binary = Tensor::full(&[3], 0.5, false);
    assert!(matches!(a.masked_select(&not_binary), Err(TensorError::InvalidArgument(_))));
}

#[test]
fn test_extreme_slice_steps_and_reshape_dims_are_errors_not_panics() {
    let a = grid(2, 5, false);
    let far = a.slice(&[SliceArg::Full, SliceArg::step(Some(1), None, isize::MAX)]).unwrap();
    assert_eq!(far.data(), &arr2(&[[1.0], [6.0]]).into_dyn());
    let back = a.slice(&[SliceArg::Full, SliceArg::step(None, None, isize::MIN + 1)]).unwrap();
    assert_eq!(back.data(), &arr2(&[[4.0], [9.0]]).into_dyn());

    assert!(matches!(
        a.slice(&[SliceArg::step(None, None, isize::MIN)]),
        Err(TensorError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.reshape(&[isize::MAX, isize::MAX, 0]),
        Err(TensorError::Shape(_))
    ));
}

#[test]
fn test_topk_ranks_nan_below_numbers() {
    let a = Tensor::new(arr1(&[1.0, f32::NAN, 3.0, -f32::NAN]).into_dyn(), false);
    let (values, indices) = a.topk(2, 0).unwrap();
    assert_eq!(values.data(), &arr1(&[3.0, 1.0]).into_dyn());
    assert_eq!(indices.data(), &arr1(&[2.0, 0.0]).into_dyn());

    let (all, _) = a.topk(4, 0).unwrap();
    assert!(all.data()[[2]].is_nan() && all.data()[[3]].is_nan());
}

#[test]
fn test_topk_values_indices_and_routing() {
    let a = Tensor::new(arr2(&[[1.0, 9.0, 3.0, 7.0], [4.0, 2.0, 8.0, 6.0]]).into_dyn(), true);
    let (values, indices) = a.topk(2, -1).unwrap();
    assert_eq!(values.data(), &arr2(&[[9.0, 7.0], [8.0, 6.0]]).into_dyn());
    assert_eq!(indices.data(), &arr2(&[[1.0, 3.0], [2.0, 3.0]]).into_dyn());
    assert_eq!(indices.dtype(), DType::I64);
    assert!(!indices.requires_grad());

    values.sum().unwrap().backward().unwrap();
    assert_eq!(
        a.grad().unwrap(),
        arr2(&[[0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]]).into_dyn()
    );
}

#[test]
fn test_topk_argument_errors() {
    let a = grid(2, 3, false);
    assert!(matches!(a.topk(0, 1), Err(TensorError::InvalidArgument(_))));
    assert!(matches!(a.topk(4, 1), Err(TensorError::Shape(_))));
    assert!(matches!(a.topk(1, 2), Err(TensorError::Shape(_))));
}

#[test]
fn test_masked_fill_blocks_gradient() {
    let a = Tensor::new(arr1(&[1.0, 2.0, 3.0]).into_dyn(), true);
    let mask = Tensor::from_bools(vec![false, true, false], &[3]).unwrap();
    let filled = a.masked_fill(&mask, f32::NEG_INFINITY).unwrap();
    assert_eq!(filled.data()[[1]], f32::NEG_INFINITY);

    let probs = filled.softmax(0).unwrap();
    assert_eq!(probs.data()[[1]], 0.0);
    probs.mul(&a).unwrap().sum().unwrap().backward().unwrap();
    assert!(a.grad().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_masked_fill_rejects_non_binary_mask() {
    let a = Tensor::ones(&[3], false);
    let mask = Tensor::new(arr1(&[0.0, 0.5, 1.0]).into_dyn(), false);
    assert!(matches!(a.masked_fill(&mask, 0.0), Err(TensorError::InvalidArgument(_))));
    let wide = Tensor::from_bools(vec![true; 4], &[4]).unwrap();
    assert!(matches!(a.masked_fill(&wide, 0.0), Err(TensorError::Shape(_))));
}

#[test]
fn test_concat_and_stack_shapes() {
    let a = grid(2, 3, false);
    let b = grid(1, 3, false);
    let c = Tensor::concat(&[a.clone(), b.clone()], 0).unwrap();
    assert_eq!(c.shape(), &[3, 3]);
    assert!(matches!(Tensor::concat(&[a.clone(), b.clone()], 1), Err(TensorError::Shape(_))));
    assert!(matches!(Tensor::concat(&[], 0), Err(TensorError::InvalidArgument(_))));

    let s = Tensor::stack(&[a.clone(), a.clone()], 1).unwrap();
    assert_eq!(s.shape(), &[2, 2, 3]);
    assert!(matches!(Tensor::stack(&[a, b], 0), Err(TensorError::Shape(_))));
}

#[test]
fn test_repeat_interleave_and_flip_values() {
    let a = grid(2, 2, false);
    let r = a.repeat_interleave(2, Some(1)).unwrap();
    assert_eq!(r.data(), &arr2(&[[0.0, 0.0, 1.0, 1.0], [2.0, 2.0, 3.0, 3.0]]).into_dyn());
    let flat = a.repeat_interleave(2, None).unwrap();
    assert_eq!(flat.shape(), &[8]);
    assert!(matches!(a.repeat_interleave(0, None), Err(TensorError::InvalidArgument(_))));

    let f = a.flip(&[0, 1]).unwrap();
    assert_eq!(f.data(), &arr2(&[[3.0, 2.0], [1.0, 0.0]]).into_dyn());
}

#[test]
fn test_reshape_and_permute_errors() {
    let a = Tensor::new(arr3(&[[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]]).into_dyn(), false);
    assert_eq!(a.reshape(&[3, -1]).unwrap().shape(), &[3, 2]);
    assert!(matches!(a.reshape(&[4, -1]), Err(TensorError::Shape(_))));
    assert!(matches!(a.reshape(&[-1, -1]), Err(TensorError::Shape(_))));
    assert!(matches!(a.permute(&[0, 0, 1]), Err(TensorError::Shape(_))));
    assert!(matches!(a.sum_axes(&[3], false), Err(TensorError::Shape(_))));
    assert!(matches!(a.sum_axes(&[1, -2], false), Err(TensorError::Shape(_))));
}

#[test]
fn test_zero_length_reduction_is_shape_error() {
    let empty = Tensor::new(ArrayD::zeros(IxDyn(&[2, 0])), true);
    assert!(matches!(empty.mean(), Err(TensorError::Shape(_))));
    assert!(matches!(empty.max_axes(&[1], false), Err(TensorError::Shape(_))));
    // reducing the non-empty axis is fine
    assert_eq!(empty.sum_axes(&[0], false).unwrap().shape(), &[0]);
}

#[test]
fn test_max_ties_share_gradient() {
    let a = Tensor::new(arr1(&[3.0, 1.0, 3.0]).into_dyn(), true);
    a.max_axes(&[0], false).unwrap().backward().unwrap();
    assert_eq!(a.grad().unwrap(), arr1(&[1.0, 0.0, 1.0]).into_dyn());
}

#[test]
fn test_nan_propagates_through_arithmetic() {
    let a = Tensor::new(arr1(&[0.0, 1.0]).into_dyn(), false);
    let b = Tensor::new(arr1(&[0.0, 1.0]).into_dyn(), false);
    let q = a.div(&b).unwrap();
    assert!(q.data()[[0]].is_nan());
    assert_eq!(q.data()[[1]], 1.0);
    assert!(a.log().unwrap().data()[[0]].is_infinite());
}
