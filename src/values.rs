//! Scalar values which form the computation graph every tensor is built from
use std::{
    cell::RefCell,
    collections::HashSet,
    fmt::{self, Debug, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use rand::Rng;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_two_operands,
};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new leaf value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc, children: &[&Value]) -> Self {
        let result = Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
        ))));
        for child in children {
            result.0.borrow_mut().children.push(child.0.clone());
        }
        result
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be exclusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Zeros the gradient of every node this value was computed from, itself included
    pub fn zero_grad(&self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    /// Backpropagates from this value. Gradients are added to whatever the nodes
    /// already hold, so callers zero them first when starting a fresh pass.
    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // apply backprop, reversed to start from root first
        for value in self.topological_order().into_iter().rev() {
            let n_operands = value.0.borrow().children.len();
            if let Some(f) = value.0.borrow().backprop_fn {
                debug_assert!(f.n_operands() == n_operands);
            }
            match n_operands {
                0 => {}
                1 => {
                    let in1 = Value(value.0.borrow().children[0].clone());
                    update_gradients_one_operand(&in1, &value);
                }
                2 => {
                    let in1 = Value(value.0.borrow().children[0].clone());
                    let in2 = Value(value.0.borrow().children[1].clone());
                    update_gradients_two_operands(&in1, &in2, &value);
                }
                _ => {
                    panic!("Unsupported number of operands: {}", n_operands);
                }
            }
        }
    }

    /// Ids of all nodes this value depends on, itself included
    pub fn reachable_ids(&self) -> HashSet<u64> {
        self.topological_order().iter().map(Value::id).collect()
    }

    /// Post-order over the graph below `self`: every node appears after all of its children.
    /// Iterative so long chains (e.g. large sums) do not exhaust the stack.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, children_done)) = stack.pop() {
            if children_done {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            stack.push((value.clone(), true));
            for c in value.0.borrow().children.iter() {
                if !visited.contains(&c.borrow().id) {
                    stack.push((Value(c.clone()), false));
                }
            }
        }
        order
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, other: &Value) -> Value {
        let data = self.data().powf(other.data());
        Value::new_derived(data, BackpropFunc::Pow, &[self, other])
    }

    pub fn relu(&self) -> Value {
        Value::new_derived(self.data().max(0.0), BackpropFunc::ReLU, &[self])
    }

    pub fn exp(&self) -> Value {
        Value::new_derived(self.data().exp(), BackpropFunc::Exp, &[self])
    }

    pub fn ln(&self) -> Value {
        Value::new_derived(self.data().ln(), BackpropFunc::Ln, &[self])
    }

    /// Larger of two values, the gradient flows to the winner (ties go to `self`)
    pub fn max(&self, other: &Value) -> Value {
        let data = self.data().max(other.data());
        Value::new_derived(data, BackpropFunc::Max, &[self, other])
    }
}

// pretty print a value and its children recursively in a JSON-like format
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_value(value: &Value, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let inner = value.0.borrow();
            let indent_str = " ".repeat(indent);
            let indent_inner = " ".repeat(indent + 2);
            writeln!(f, "{}{{", indent_str)?;
            writeln!(f, "{}\"data\": {},", indent_inner, inner.data)?;
            writeln!(f, "{}\"grad\": {},", indent_inner, inner.grad)?;
            writeln!(f, "{}\"id\": {},", indent_inner, inner.id)?;
            writeln!(
                f,
                "{}\"backprop_fn\": {:?},",
                indent_inner, inner.backprop_fn
            )?;
            writeln!(f, "{}\"children\": [", indent_inner)?;
            for (i, child) in inner.children.iter().enumerate() {
                let child_value = Value(child.clone());
                fmt_value(&child_value, indent + 4, f)?;
                if i < inner.children.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", indent_inner)?;
            write!(f, "{}}}", indent_str)
        }
        fmt_value(self, 0, f)
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        let data = self.data() + other.data();
        Value::new_derived(data, BackpropFunc::Add, &[self, other])
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        let data = self.data() - other.data();
        Value::new_derived(data, BackpropFunc::Sub, &[self, other])
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        let data = self.data() * other.data();
        Value::new_derived(data, BackpropFunc::Mul, &[self, other])
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        let data = if other.data().is_nan() {
            0.0
        } else {
            self.data() / other.data()
        };
        Value::new_derived(data, BackpropFunc::Div, &[self, other])
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::new_derived(-self.data(), BackpropFunc::Neg, &[self])
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Value::new(0.0), |acc, v| acc + v)
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

impl From<f32> for Value {
    fn from(data: f32) -> Self {
        Value::new(data)
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    // 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: f32,
    /// gradient of the value with respect to the output
    pub(crate) grad: f32,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random()
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    #[test]
    fn test_add() {
        let a = Value::new(2.0);
        let b = Value::new(3.0);

        let c = &a + &b;
        assert_eq!(c.data(), 5.0);
        c.backward();

        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
    }

    #[test]
    fn test_div() {
        let a = Value::new(2.0);
        let b = Value::new(3.0);

        let c = &a / &b;
        assert_eq_float!(c.data(), 2.0 / 3.0);

        c.backward();

        // dc/da = 1/b
        // dc/db = -a/b^2
        assert_eq_float!(a.grad(), 1.0 / 3.0);
        assert_eq_float!(b.grad(), -2.0 / 9.0);
    }

    #[test]
    fn test_ln_and_max() {
        let a = Value::new(2.0);
        let b = Value::new(5.0);
        let c = a.max(&b);
        assert_eq!(c.data(), 5.0);
        let d = c.ln();
        assert_eq_float!(d.data(), 5.0f32.ln());

        d.backward();
        // the loser of max receives no gradient
        assert_eq!(a.grad(), 0.0);
        assert_eq_float!(b.grad(), 1.0 / 5.0);
    }

    #[test]
    fn test_shared_node_gradient() {
        // a feeds the output through two paths: out = a * a + a
        let a = Value::new(3.0);
        let sq = &a * &a;
        let out = &sq + &a;
        out.backward();
        assert_eq_float!(a.grad(), 2.0 * 3.0 + 1.0);
    }

    #[test]
    fn test_zero_grad_then_backward() {
        let a = Value::new(2.0);
        let b = Value::new(4.0);
        let c = &a * &b;
        c.backward();
        c.backward();
        assert_eq!(a.grad(), 8.0);

        c.zero_grad();
        c.backward();
        assert_eq!(a.grad(), 4.0);
        assert_eq!(b.grad(), 2.0);
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let leaves: Vec<Value> = (0..5_000).map(|_| Value::new(1.0)).collect();
        let total = leaves.iter().cloned().sum::<Value>();
        assert_eq!(total.data(), 5_000.0);
        total.backward();
        assert_eq!(leaves[0].grad(), 1.0);
        assert_eq!(leaves[4_999].grad(), 1.0);
    }

    #[test]
    fn test_reachable_ids() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let unrelated = Value::new(3.0);
        let c = &a + &b;
        let ids = c.reachable_ids();
        assert!(ids.contains(&a.id()));
        assert!(ids.contains(&b.id()));
        assert!(ids.contains(&c.id()));
        assert!(!ids.contains(&unrelated.id()));
    }
}
