//! Basic stack manipulation

use crate::exec::{protect, stack};
use crate::state::{EXTRA_STACK, MAX_STACK, REGISTRY_INDEX};
use crate::value::Value;
use crate::vm::{ThreadId, Vm};

impl Vm {
    /// Normalize a relative index into an absolute one. Pseudo-indices
    /// pass through unchanged.
    pub fn abs_index(&self, t: ThreadId, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            let th = self.th(t);
            (th.top as i64 - th.ci().func as i64 + idx as i64) as i32
        }
    }

    /// Number of live values in the current frame.
    pub fn get_top(&self, t: ThreadId) -> usize {
        self.th(t).frame_height()
    }

    /// Set the frame height: grows fill with nil, negative indices
    /// truncate relative to the current top.
    pub fn set_top(&mut self, t: ThreadId, idx: i32) {
        let th = self.th_mut(t);
        let func = th.ci().func;
        if idx >= 0 {
            debug_assert!(
                idx as usize <= th.stack_last - (func + 1),
                "new top too large"
            );
            let target = func + 1 + idx as usize;
            while th.top < target {
                th.stack[th.top] = Value::Nil;
                th.top += 1;
            }
            th.top = target;
        } else {
            debug_assert!(
                (-(idx + 1)) as usize <= th.top - (func + 1),
                "invalid new top"
            );
            th.top = (th.top as i64 + idx as i64 + 1) as usize;
        }
    }

    /// Pop `n` values.
    pub fn pop(&mut self, t: ThreadId, n: usize) {
        self.set_top(t, -(n as i32) - 1);
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, t: ThreadId, idx: i32) {
        let v = self.index_value(t, idx).unwrap_or(Value::Nil);
        self.push(t, v);
    }

    /// Remove the value at `idx`, shifting everything above it down.
    pub fn remove(&mut self, t: ThreadId, idx: i32) {
        let Some(mut p) = self.stack_slot(t, idx) else { return };
        let th = self.th_mut(t);
        while p + 1 < th.top {
            th.stack[p] = th.stack[p + 1];
            p += 1;
        }
        th.top -= 1;
    }

    /// Move the top value into `idx`, shifting everything above it up.
    pub fn insert(&mut self, t: ThreadId, idx: i32) {
        let Some(p) = self.stack_slot(t, idx) else { return };
        let th = self.th_mut(t);
        let mut q = th.top;
        while q > p {
            th.stack[q] = th.stack[q - 1];
            q -= 1;
        }
        th.stack[p] = th.stack[th.top];
    }

    /// Pop the top value into `idx`.
    pub fn replace(&mut self, t: ThreadId, idx: i32) {
        debug_assert!(self.th(t).frame_height() >= 1);
        let top = self.th(t).top;
        let v = self.sv(t, top - 1);
        let place = self.index_place(t, idx);
        self.place_store(t, place, v);
        self.th_mut(t).top -= 1;
    }

    /// Copy the value at `from` into `to` without disturbing the top.
    pub fn copy(&mut self, t: ThreadId, from: i32, to: i32) {
        let v = self.index_value(t, from).unwrap_or(Value::Nil);
        let place = self.index_place(t, to);
        self.place_store(t, place, v);
    }

    /// Ensure at least `n` free slots above the top, growing if
    /// possible. Never raises: reports failure by returning false.
    pub fn check_stack(&mut self, t: ThreadId, n: usize) -> bool {
        let (enough, overflow) = {
            let th = self.th(t);
            (
                th.stack_last - th.top > n,
                th.top + EXTRA_STACK + n > MAX_STACK,
            )
        };
        let ok = if enough {
            true
        } else if overflow {
            false
        } else {
            protect::raw_run_protected(self, t, |vm, t| stack::grow_stack(vm, t, n))
                == crate::Status::Ok
        };
        if ok {
            let th = self.th_mut(t);
            let want = th.top + n;
            if th.ci().top < want {
                th.ci_mut().top = want;
            }
        }
        ok
    }

    /// Move the top `n` values from one thread to another of the same
    /// runtime.
    pub fn xmove(&mut self, from: ThreadId, to: ThreadId, n: usize) {
        if from == to {
            return;
        }
        debug_assert!(self.th(from).frame_height() >= n);
        debug_assert!(self.th(to).ci().top - self.th(to).top >= n);
        self.th_mut(from).top -= n;
        let base = self.th(from).top;
        for i in 0..n {
            let v = self.sv(from, base + i);
            let th = self.th_mut(to);
            th.stack[th.top] = v;
            th.top += 1;
        }
    }

    /// Absolute stack position for a (non-pseudo) index, if valid.
    fn stack_slot(&self, t: ThreadId, idx: i32) -> Option<usize> {
        match self.index_place(t, idx) {
            super::Place::Stack(p) => Some(p),
            _ => {
                debug_assert!(false, "stack index expected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_top() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        assert_eq!(vm.get_top(t), 0);
        vm.push(t, Value::Number(1.0));
        vm.push(t, Value::Number(2.0));
        assert_eq!(vm.get_top(t), 2);
        vm.set_top(t, 4); // grows with nil
        assert_eq!(vm.get_top(t), 4);
        assert!(vm.index_value(t, 4).unwrap().is_nil());
        vm.set_top(t, -3); // drop one
        assert_eq!(vm.get_top(t), 3);
        vm.set_top(t, 0);
        assert_eq!(vm.get_top(t), 0);
    }

    #[test]
    fn test_abs_index_idempotent() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push(t, Value::Number(1.0));
        vm.push(t, Value::Number(2.0));
        let a = vm.abs_index(t, -1);
        assert_eq!(a, 2);
        assert_eq!(vm.abs_index(t, a), a);
        assert_eq!(vm.abs_index(t, REGISTRY_INDEX), REGISTRY_INDEX);
    }

    #[test]
    fn test_insert_remove() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        for i in 1..=3 {
            vm.push(t, Value::Number(i as f64));
        }
        vm.push(t, Value::Number(99.0));
        vm.insert(t, 1); // 99 1 2 3
        assert_eq!(vm.index_value(t, 1), Some(Value::Number(99.0)));
        assert_eq!(vm.index_value(t, 4), Some(Value::Number(3.0)));
        vm.remove(t, 1); // 1 2 3
        assert_eq!(vm.index_value(t, 1), Some(Value::Number(1.0)));
        assert_eq!(vm.get_top(t), 3);
    }

    #[test]
    fn test_replace_and_copy() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push(t, Value::Number(1.0));
        vm.push(t, Value::Number(2.0));
        vm.push(t, Value::Number(3.0));
        vm.replace(t, 1); // 3 2
        assert_eq!(vm.get_top(t), 2);
        assert_eq!(vm.index_value(t, 1), Some(Value::Number(3.0)));
        vm.copy(t, 2, 1); // 2 2
        assert_eq!(vm.index_value(t, 1), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_check_stack_extends_frame() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        assert!(vm.check_stack(t, 100));
        let th = vm.th(t);
        assert!(th.ci().top >= th.top + 100);
        // an absurd request is refused, not fatal
        assert!(!vm.check_stack(t, MAX_STACK + 1));
    }

    #[test]
    fn test_xmove() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let co = vm.new_thread(t).unwrap();
        vm.push(t, Value::Number(7.0));
        vm.push(t, Value::Number(8.0));
        vm.xmove(t, co, 2);
        assert_eq!(vm.get_top(co), 2);
        assert_eq!(vm.index_value(co, 1), Some(Value::Number(7.0)));
        assert_eq!(vm.index_value(co, 2), Some(Value::Number(8.0)));
        // only the coroutine object remains on the main stack
        assert_eq!(vm.get_top(t), 1);
    }

    #[test]
    fn test_no_value_sentinel_between_top_and_frame_ceiling() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push(t, Value::Number(1.0));
        assert_eq!(vm.index_value(t, 1), Some(Value::Number(1.0)));
        assert_eq!(vm.index_value(t, 2), None);
    }
}
