use std::fs;
use std::path::Path;

use crate::error::OpError;
use crate::job::Job;

/// Load a job description (operator configurations and fed tensors) from a
/// JSON file.
pub fn load_job_from_path(path: impl AsRef<Path>) -> Result<Job, OpError> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| OpError::io(path_ref, err))?;
    load_job_from_str(&contents)
}

pub fn load_job_from_str(contents: &str) -> Result<Job, OpError> {
    Ok(serde_json::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrValue;
    use crate::error::ErrorKind;
    use crate::infer::InferOptions;
    use crate::job::infer_job;
    use crate::registry::OpRegistryBuilder;

    const JOB: &str = r#"{
        "tensors": {
            "in/x": {"shape": [4, 5], "data_type": "float32", "batch_axis": 0},
            "in/like": {"shape": [5], "data_type": "float32"}
        },
        "ops": [{
            "name": "op1",
            "op_type_name": "reduce_sum_like",
            "input": {"x": ["in/x"], "like": ["in/like"]},
            "output": {"y": ["op1/y_0"]},
            "attr": {"axis": {"list_int32": [0]}}
        }]
    }"#;

    #[test]
    fn parses_job_json() {
        let job = load_job_from_str(JOB).unwrap();
        assert_eq!(job.tensors.len(), 2);
        assert_eq!(job.tensors["in/x"].batch_axis, Some(0));
        let op = &job.ops[0];
        assert_eq!(op.input["x"], vec!["in/x".to_string()]);
        assert_eq!(
            op.attr.get_value("axis").unwrap(),
            &AttrValue::ListInt32(vec![0])
        );
    }

    #[test]
    fn reports_parse_and_io_errors() {
        assert_eq!(
            load_job_from_str("{not json").unwrap_err().kind(),
            ErrorKind::Io
        );
        let err = load_job_from_path("/nonexistent/job.json").unwrap_err();
        assert!(matches!(err, OpError::Io { .. }));
    }

    #[test]
    fn demo_job_infers() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/reduce_sum_like.json");
        let job = load_job_from_path(path).unwrap();
        let registry = OpRegistryBuilder::with_builtins().unwrap().seal();
        let inference = infer_job(&registry, &job, &InferOptions::default()).unwrap();
        assert_eq!(inference.tensors["op1/y_0"].shape.dims(), &[5]);
        assert_eq!(inference.tensors["op2/y_0"].shape.dims(), &[4, 5]);
        assert_eq!(inference.tensors["op2/y_0"].batch_axis, Some(0));
    }
}
