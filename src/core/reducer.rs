//! Reducer：按字段合并策略把更新并入当前值
//!
//! 每个字段在声明时固定一种策略：
//! - Replace：更新必须显式标记为 replace，新值整体替换旧值；
//! - Append：更新按顺序追加到旧值之后；也接受 replace 标记，用于一次性重置字段。
//!
//! 序列化格式：`{"mode": "replace", "value": ...}` 为替换；未带标记的裸值视为追加。
//! 兄弟研究单元的并发更新通过 `Channel::apply_ordered` 按派发序合并，与完成顺序无关。

use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 字段合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    Replace,
    Append,
}

/// 可追加合并的值类型
pub trait Reducible {
    fn concat(&mut self, other: Self);
}

impl<T> Reducible for Vec<T> {
    fn concat(&mut self, other: Self) {
        self.extend(other);
    }
}

impl Reducible for String {
    fn concat(&mut self, other: Self) {
        self.push_str(&other);
    }
}

/// 更新信封：未标记的更新即 Append
#[derive(Debug, Clone, PartialEq)]
pub enum Update<V> {
    Append(V),
    Replace(V),
}

impl<V> Update<V> {
    pub fn is_replace(&self) -> bool {
        matches!(self, Update::Replace(_))
    }
}

impl<V> From<V> for Update<V> {
    fn from(value: V) -> Self {
        Update::Append(value)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UpdateMode {
    Append,
    Replace,
}

#[derive(Serialize)]
struct Envelope<'a, V> {
    mode: UpdateMode,
    value: &'a V,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UpdateRepr<V> {
    Tagged { mode: UpdateMode, value: V },
    Bare(V),
}

impl<V: Serialize> Serialize for Update<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (mode, value) = match self {
            Update::Append(v) => (UpdateMode::Append, v),
            Update::Replace(v) => (UpdateMode::Replace, v),
        };
        Envelope { mode, value }.serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Update<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match UpdateRepr::deserialize(deserializer)? {
            UpdateRepr::Tagged { mode: UpdateMode::Replace, value } => Update::Replace(value),
            UpdateRepr::Tagged { mode: UpdateMode::Append, value } => Update::Append(value),
            UpdateRepr::Bare(value) => Update::Append(value),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReducerError {
    #[error("Field '{field}' uses replace policy; update must be tagged as replace")]
    UntaggedReplace { field: String },

    #[error("Field '{field}' is write-once and already set")]
    AlreadyWritten { field: String },
}

/// 字段声明：名称 + 固定策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: Cow<'static, str>,
    pub policy: MergePolicy,
}

impl FieldSpec {
    pub const fn new(name: &'static str, policy: MergePolicy) -> Self {
        Self {
            name: Cow::Borrowed(name),
            policy,
        }
    }
}

fn validate<V>(field: &FieldSpec, update: &Update<V>) -> Result<(), ReducerError> {
    if field.policy == MergePolicy::Replace && !update.is_replace() {
        return Err(ReducerError::UntaggedReplace {
            field: field.name.to_string(),
        });
    }
    Ok(())
}

/// apply(field, current, update) -> new
pub fn apply<V: Reducible>(field: &FieldSpec, mut current: V, update: Update<V>) -> Result<V, ReducerError> {
    validate(field, &update)?;
    Ok(match update {
        Update::Replace(v) => v,
        Update::Append(v) => {
            current.concat(v);
            current
        }
    })
}

/// 带策略的状态字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel<V> {
    spec: FieldSpec,
    value: V,
}

impl<V: Reducible + Default> Channel<V> {
    pub fn new(name: &'static str, policy: MergePolicy) -> Self {
        Self {
            spec: FieldSpec::new(name, policy),
            value: V::default(),
        }
    }

    pub fn appending(name: &'static str) -> Self {
        Self::new(name, MergePolicy::Append)
    }

    pub fn replacing(name: &'static str) -> Self {
        Self::new(name, MergePolicy::Replace)
    }

    /// 以初始值声明字段
    pub fn seeded(name: &'static str, policy: MergePolicy, value: V) -> Self {
        Self {
            spec: FieldSpec::new(name, policy),
            value,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn apply(&mut self, update: Update<V>) -> Result<(), ReducerError> {
        validate(&self.spec, &update)?;
        match update {
            Update::Replace(v) => self.value = v,
            Update::Append(v) => self.value.concat(v),
        }
        Ok(())
    }

    /// 合并一批并发更新：先按派发序号稳定排序，全部校验通过后再依次应用
    pub fn apply_ordered(
        &mut self,
        updates: impl IntoIterator<Item = (usize, Update<V>)>,
    ) -> Result<(), ReducerError> {
        let mut updates: Vec<(usize, Update<V>)> = updates.into_iter().collect();
        updates.sort_by_key(|(index, _)| *index);
        for (_, update) in &updates {
            validate(&self.spec, update)?;
        }
        for (_, update) in updates {
            self.apply(update)?;
        }
        Ok(())
    }
}

impl<T> Channel<Vec<T>> {
    /// 追加单个元素（未标记更新）
    pub fn push(&mut self, item: T) -> Result<(), ReducerError> {
        validate(&self.spec, &Update::<()>::Append(()))?;
        self.value.push(item);
        Ok(())
    }
}
