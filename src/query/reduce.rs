use serde_json::{json, Number, Value};

/// 跨分区归并函数：输入同一 key（或整个区间）的全部 value
pub trait Reducer: Send + Sync {
    fn name(&self) -> &str;
    fn reduce(&self, values: &[Value]) -> Value;
}

/// 行数
#[derive(Debug, Default, Clone, Copy)]
pub struct Count;

impl Reducer for Count {
    fn name(&self) -> &str {
        "_count"
    }

    fn reduce(&self, values: &[Value]) -> Value {
        json!(values.len())
    }
}

/// 数值求和：非数值忽略；全部是整数时保持整数输出
#[derive(Debug, Default, Clone, Copy)]
pub struct Sum;

impl Reducer for Sum {
    fn name(&self) -> &str {
        "_sum"
    }

    fn reduce(&self, values: &[Value]) -> Value {
        let mut int_sum: Option<i64> = Some(0);
        let mut float_sum = 0.0f64;
        for v in values {
            let Value::Number(n) = v else { continue };
            float_sum += n.as_f64().unwrap_or(0.0);
            int_sum = match (int_sum, n.as_i64()) {
                (Some(acc), Some(i)) => acc.checked_add(i),
                _ => None,
            };
        }
        match int_sum {
            Some(i) => json!(i),
            None => Number::from_f64(float_sum)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

/// sum / count / min / max / sumsqr
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats;

impl Reducer for Stats {
    fn name(&self) -> &str {
        "_stats"
    }

    fn reduce(&self, values: &[Value]) -> Value {
        let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
        if nums.is_empty() {
            return json!({"sum": 0, "count": 0, "min": null, "max": null, "sumsqr": 0});
        }
        let sum: f64 = nums.iter().sum();
        let min = nums.iter().copied().fold(f64::INFINITY, f64::min);
        let max = nums.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sumsqr: f64 = nums.iter().map(|n| n * n).sum();
        json!({
            "sum": sum,
            "count": nums.len(),
            "min": min,
            "max": max,
            "sumsqr": sumsqr,
        })
    }
}

/// 闭包 reducer
pub struct FnReducer<F> {
    name: String,
    f: F,
}

impl<F> FnReducer<F>
where
    F: Fn(&[Value]) -> Value + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Reducer for FnReducer<F>
where
    F: Fn(&[Value]) -> Value + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reduce(&self, values: &[Value]) -> Value {
        (self.f)(values)
    }
}

/// 按名字取内置 reducer（CLI 使用）
pub fn builtin(name: &str) -> Option<std::sync::Arc<dyn Reducer>> {
    match name.trim_start_matches('_') {
        "count" => Some(std::sync::Arc::new(Count)),
        "sum" => Some(std::sync::Arc::new(Sum)),
        "stats" => Some(std::sync::Arc::new(Stats)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_keeps_integers_and_ignores_non_numbers() {
        assert_eq!(Sum.reduce(&[json!(1), json!(2), json!("x")]), json!(3));
        assert_eq!(Sum.reduce(&[json!(1), json!(0.5)]), json!(1.5));
        assert_eq!(Sum.reduce(&[]), json!(0));
    }

    #[test]
    fn stats_and_count() {
        let v = Stats.reduce(&[json!(1), json!(3)]);
        assert_eq!(v["count"], json!(2));
        assert_eq!(v["min"], json!(1.0));
        assert_eq!(v["max"], json!(3.0));
        assert_eq!(v["sumsqr"], json!(10.0));
        assert_eq!(Count.reduce(&[json!(null), json!(null)]), json!(2));
    }

    #[test]
    fn closure_reducer_and_builtin_lookup() {
        let r = FnReducer::new("first", |vs: &[Value]| vs.first().cloned().unwrap_or(Value::Null));
        assert_eq!(r.reduce(&[json!("a"), json!("b")]), json!("a"));
        assert_eq!(builtin("_sum").unwrap().name(), "_sum");
        assert!(builtin("median").is_none());
    }
}
