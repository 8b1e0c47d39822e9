//! A small deterministic machine for exercising the checkpointer.

use vmcp_types::{Hash, StructuralHasher, Value};

use crate::machine::{Machine, MachineError, MachineImage};

const FIB_CODE: &[u8] = b"fib-v1: a, b <- b, a + b; push a";

/// Computes Fibonacci numbers, keeping every emitted number on a stack built
/// from nested pairs so consecutive snapshots share most of their values.
#[derive(Clone, Debug)]
pub(crate) struct FibMachine {
    a: i64,
    b: i64,
    steps: i64,
    stack: Value,
    statics: Value,
}

impl FibMachine {
    pub(crate) fn new() -> Self {
        let statics = Value::tuple(vec![
            Value::int(0),
            Value::int(1),
            Value::tuple(vec![Value::int(2), Value::EmptyTuple]).unwrap(),
        ])
        .unwrap();
        Self {
            a: 0,
            b: 1,
            steps: 0,
            stack: Value::EmptyTuple,
            statics,
        }
    }

    pub(crate) fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            let next = self.a.wrapping_add(self.b);
            self.stack = Value::tuple(vec![Value::int(self.a), self.stack.clone()]).unwrap();
            self.a = self.b;
            self.b = next;
            self.steps += 1;
        }
    }

    pub(crate) fn steps(&self) -> i64 {
        self.steps
    }
}

impl Machine for FibMachine {
    fn machine_hash(&self) -> Hash {
        let image = self.to_image();
        let mut parts = vec![StructuralHasher::MACHINE.hash(&image.code)];
        parts.extend(image.roots.iter().map(Value::hash));
        StructuralHasher::MACHINE.hash_children(&parts)
    }

    fn to_image(&self) -> MachineImage {
        MachineImage {
            code: FIB_CODE.to_vec(),
            roots: vec![
                Value::int(self.a),
                Value::int(self.b),
                Value::int(self.steps),
                self.stack.clone(),
                self.statics.clone(),
            ],
        }
    }

    fn from_image(image: MachineImage) -> Result<Self, MachineError> {
        if image.code != FIB_CODE {
            return Err(MachineError("unknown program".into()));
        }
        let [a, b, steps, stack, statics]: [Value; 5] = image
            .roots
            .try_into()
            .map_err(|_| MachineError("expected 5 roots".into()))?;
        let int = |v: &Value, name: &str| {
            v.as_int()
                .ok_or_else(|| MachineError(format!("{name} is not an integer")))
        };
        Ok(Self {
            a: int(&a, "a")?,
            b: int(&b, "b")?,
            steps: int(&steps, "steps")?,
            stack,
            statics,
        })
    }
}

/// Forgets its step counter on restore, so its hash never survives a
/// round-trip.
#[derive(Debug)]
pub(crate) struct ForgetfulMachine(pub(crate) FibMachine);

impl Machine for ForgetfulMachine {
    fn machine_hash(&self) -> Hash {
        self.0.machine_hash()
    }

    fn to_image(&self) -> MachineImage {
        self.0.to_image()
    }

    fn from_image(mut image: MachineImage) -> Result<Self, MachineError> {
        image.roots[2] = Value::int(-1);
        FibMachine::from_image(image).map(Self)
    }
}
