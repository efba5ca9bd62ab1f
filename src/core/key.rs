use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 视图 key：map 阶段 emit 出来的 JSON 值，按视图排序规则（collation）比较。
///
/// 排序：`null < false < true < number < string < array < object`
/// - number 按数值精确比较（`1 == 1.0`，2^53 以上的整数不与相邻浮点数混同）
/// - string 按 code point 比较
/// - array 逐元素比较，前缀相同时短者在前
/// - object 逐对比较 (key, value)，前缀相同时字段少者在前
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewKey(pub Value);

impl ViewKey {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// 持久化编码（bincode 不支持 `deserialize_any`，统一落成 JSON 文本）
    pub fn to_json(&self) -> String {
        self.0.to_string()
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s).map(Self)
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// JSON 数字的精确比较：整数按 i128 比较，整数与浮点不经 f64 折算。
fn cmp_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    match (as_int(a), as_int(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => cmp_int_float(x, b.as_f64().unwrap_or(0.0)),
        (None, Some(y)) => cmp_int_float(y, a.as_f64().unwrap_or(0.0)).reverse(),
        (None, None) => {
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
    }
}

fn as_int(n: &serde_json::Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// JSON 里没有 NaN / 无穷
fn cmp_int_float(i: i128, f: f64) -> Ordering {
    let t = f.trunc();
    if t >= i128::MAX as f64 {
        return Ordering::Less;
    }
    if t < i128::MIN as f64 {
        return Ordering::Greater;
    }
    match i.cmp(&(t as i128)) {
        Ordering::Equal => f.partial_cmp(&t).map_or(Ordering::Equal, Ordering::reverse),
        o => o,
    }
}

/// 视图排序规则下的 JSON 比较
pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let o = collate(x, y);
                if o != Ordering::Equal {
                    return o;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys.iter()) {
                let o = kx.cmp(ky).then_with(|| collate(vx, vy));
                if o != Ordering::Equal {
                    return o;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

impl PartialEq for ViewKey {
    fn eq(&self, other: &Self) -> bool {
        collate(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for ViewKey {}

impl PartialOrd for ViewKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ViewKey {
    fn cmp(&self, other: &Self) -> Ordering {
        collate(&self.0, &other.0)
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for ViewKey {
    fn from(v: Value) -> Self {
        Self(v)
    }
}

impl From<&str> for ViewKey {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for ViewKey {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl From<i64> for ViewKey {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}
