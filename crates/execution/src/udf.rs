//! Scalar UDF registry and runtime interface.
//!
//! The registry starts out holding the functions from [`crate::builtins`];
//! callers may add or replace entries at runtime.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use arrow::array::ArrayRef;
use arrow_schema::DataType;
use tundra_common::Result;

use crate::builtins::builtin_udfs;

/// Stateless per-call scalar function.
pub trait ScalarUdf: Send + Sync {
    /// Stable lowercase function name (`add_two_number`).
    fn name(&self) -> &str;
    /// Output type for the given argument types; rejects bad arity or types.
    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType>;
    /// Batch-wise invocation. `num_rows` sizes the output of zero-argument functions.
    fn invoke(&self, args: &[ArrayRef], num_rows: usize) -> Result<ArrayRef>;
}

type UdfMap = HashMap<String, Arc<dyn ScalarUdf>>;

fn registry() -> &'static RwLock<UdfMap> {
    static REGISTRY: OnceLock<RwLock<UdfMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let map = builtin_udfs()
            .into_iter()
            .map(|udf| (udf.name().to_ascii_lowercase(), udf))
            .collect();
        RwLock::new(map)
    })
}

/// Register or replace a scalar UDF.
///
/// Returns `true` when an existing UDF with same name was replaced.
pub fn register_scalar_udf(udf: Arc<dyn ScalarUdf>) -> bool {
    registry()
        .write()
        .expect("udf registry lock poisoned")
        .insert(udf.name().to_ascii_lowercase(), udf)
        .is_some()
}

/// Deregister scalar UDF by name.
///
/// Returns `true` when an existing UDF was removed.
pub fn deregister_scalar_udf(name: &str) -> bool {
    registry()
        .write()
        .expect("udf registry lock poisoned")
        .remove(&name.to_ascii_lowercase())
        .is_some()
}

/// Lookup scalar UDF by name, case-insensitively.
pub fn get_scalar_udf(name: &str) -> Option<Arc<dyn ScalarUdf>> {
    registry()
        .read()
        .expect("udf registry lock poisoned")
        .get(&name.to_ascii_lowercase())
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array};
    use arrow_schema::DataType;
    use tundra_common::Result;

    use super::*;

    struct Always42;

    impl ScalarUdf for Always42 {
        fn name(&self) -> &str {
            "always_42_test"
        }

        fn return_type(&self, _arg_types: &[DataType]) -> Result<DataType> {
            Ok(DataType::Int64)
        }

        fn invoke(&self, _args: &[ArrayRef], num_rows: usize) -> Result<ArrayRef> {
            Ok(Arc::new(Int64Array::from(vec![42; num_rows])))
        }
    }

    #[test]
    fn builtins_are_preloaded_and_custom_udfs_register() {
        assert!(get_scalar_udf("ADD_TWO_NUMBER").is_some());
        assert!(!register_scalar_udf(Arc::new(Always42)));
        assert!(get_scalar_udf("always_42_test").is_some());
        assert!(deregister_scalar_udf("always_42_test"));
        assert!(get_scalar_udf("always_42_test").is_none());
    }
}
