//! 查询累加器
//!
//! 每次查询一个 `QueryState`，是匹配结果唯一的写入点：
//! - `match_pattern` 一次接收一个字的匹配位图，只有 `Count` 接受；拒绝时不改动任何状态
//! - `match_one` 逐个接收匹配，返回 false 表示扫描应当停止

use crate::common::NPOS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ReturnFirst,
    Sum,
    Max,
    Min,
    Count,
    FindAll,
    CallbackIndex,
    CallbackValue,
    CallbackNone,
    CallbackBoth,
}

/// 回调返回 false 表示不再需要后续匹配
pub enum Callback<'a> {
    Index(&'a mut dyn FnMut(usize) -> bool),
    Value(&'a mut dyn FnMut(i64) -> bool),
    NoArgs(&'a mut dyn FnMut() -> bool),
    Both(&'a mut dyn FnMut(usize, i64) -> bool),
}

impl Callback<'_> {
    fn action(&self) -> Action {
        match self {
            Callback::Index(_)  => Action::CallbackIndex,
            Callback::Value(_)  => Action::CallbackValue,
            Callback::NoArgs(_) => Action::CallbackNone,
            Callback::Both(_)   => Action::CallbackBoth,
        }
    }

    fn call(&mut self, index: usize, value: i64) -> bool {
        match self {
            Callback::Index(f)  => f(index),
            Callback::Value(f)  => f(value),
            Callback::NoArgs(f) => f(),
            Callback::Both(f)   => f(index, value),
        }
    }
}

enum Sink<'a> {
    Empty,
    Indices(&'a mut Vec<usize>),
    Callback(Callback<'a>),
}

// ── QueryState ────────────────────────────────────────────────────────────────

pub struct QueryState<'a> {
    /// 聚合值：ReturnFirst 为首个匹配下标（未命中时为 NPOS），Count 为计数
    pub state:       i64,
    pub match_count: usize,
    pub limit:       usize,
    action:          Action,
    sink:            Sink<'a>,
}

fn initial_state(action: Action) -> i64 {
    match action {
        Action::Max         => i64::MIN,
        Action::Min         => i64::MAX,
        Action::ReturnFirst => NPOS as i64,
        _                   => 0,
    }
}

impl<'a> QueryState<'a> {
    /// 纯聚合类动作（ReturnFirst/Sum/Max/Min/Count）
    pub fn new(action: Action, limit: usize) -> Self {
        debug_assert!(
            matches!(action, Action::ReturnFirst | Action::Sum | Action::Max | Action::Min | Action::Count),
            "{action:?} needs a sink"
        );
        Self { state: initial_state(action), match_count: 0, limit, action, sink: Sink::Empty }
    }

    /// 把匹配下标追加到 out
    pub fn find_all(out: &'a mut Vec<usize>, limit: usize) -> Self {
        Self { state: 0, match_count: 0, limit, action: Action::FindAll, sink: Sink::Indices(out) }
    }

    pub fn with_callback(callback: Callback<'a>, limit: usize) -> Self {
        let action = callback.action();
        Self { state: 0, match_count: 0, limit, action, sink: Sink::Callback(callback) }
    }

    pub fn action(&self) -> Action { self.action }

    /// ReturnFirst 的结果
    pub fn first_index(&self) -> usize { self.state as usize }

    pub fn is_done(&self) -> bool { self.match_count >= self.limit }

    /// pattern 中每条匹配 lane 置一位。返回 true 表示已整体消费。
    pub fn match_pattern(&mut self, _base_index: usize, pattern: u64) -> bool {
        if self.action != Action::Count || self.match_count.saturating_add(64) >= self.limit {
            return false;
        }
        self.state      += pattern.count_ones() as i64;
        self.match_count = self.state as usize;
        true
    }

    pub fn match_one(&mut self, index: usize, value: i64) -> bool {
        self.match_count += 1;
        match self.action {
            Action::ReturnFirst => {
                self.state = index as i64;
                return false;
            }
            Action::Sum => self.state = self.state.wrapping_add(value),
            Action::Max => self.state = self.state.max(value),
            Action::Min => self.state = self.state.min(value),
            Action::Count => {
                self.state      += 1;
                self.match_count = self.state as usize;
            }
            Action::FindAll => {
                if let Sink::Indices(out) = &mut self.sink {
                    out.push(index);
                }
            }
            Action::CallbackIndex | Action::CallbackValue | Action::CallbackNone | Action::CallbackBoth => {
                if let Sink::Callback(cb) = &mut self.sink {
                    if !cb.call(index, value) {
                        return false;
                    }
                }
            }
        }
        self.limit > self.match_count
    }
}

// ── FloatQueryState ───────────────────────────────────────────────────────────

/// 浮点列的聚合（只支持 Sum/Max/Min，不接受 pattern）
///
/// 节点只存整数，本 crate 的扫描不会产生浮点值：浮点列由上层自行解码，
/// 再把每块值通过 [`feed`](Self::feed) 或逐个 `match_one` 交给这里归约。
#[derive(Debug, Clone, Copy)]
pub struct FloatQueryState<T> {
    pub state:       T,
    pub match_count: usize,
    pub limit:       usize,
    action:          Action,
}

macro_rules! impl_float_state {
    ($t:ty) => {
        impl FloatQueryState<$t> {
            pub fn new(action: Action, limit: usize) -> Self {
                let state = match action {
                    Action::Sum => 0.0,
                    Action::Max => <$t>::NEG_INFINITY,
                    Action::Min => <$t>::INFINITY,
                    other => {
                        debug_assert!(false, "float reducer does not support {other:?}");
                        0.0
                    }
                };
                Self { state, match_count: 0, limit, action }
            }

            pub fn action(&self) -> Action { self.action }

            pub fn match_pattern(&mut self, _base_index: usize, _pattern: u64) -> bool { false }

            pub fn match_one(&mut self, _index: usize, value: $t) -> bool {
                self.match_count += 1;
                match self.action {
                    Action::Sum => self.state += value,
                    Action::Max => if value > self.state { self.state = value },
                    Action::Min => if value < self.state { self.state = value },
                    _ => {}
                }
                self.limit > self.match_count
            }

            /// 依次喂入 values，values[i] 的下标记为 start + i；达到 limit 时返回 false
            pub fn feed(&mut self, values: &[$t], start: usize) -> bool {
                values.iter().enumerate().all(|(i, &v)| self.match_one(start + i, v))
            }
        }
    };
}

impl_float_state!(f32);
impl_float_state!(f64);
