use serde_json::Value;

use std::fmt::{self, Display, Write};

type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub deployed: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Diff at path: '{}', deployed: {}, desired: {}",
            self.path, self.deployed, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);
impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn non_empty(&self) -> bool {
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diff<'a>> {
        self.0.iter()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "{} differences: ", self.0.len())?;
            for (i, diff) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                Display::fmt(diff, f)?;
            }
            Ok(())
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// compares the template that is currently deployed for a stack with a newly rendered one.
/// Unlike a superset check, this comparison is strict in both directions: a key or array
/// element that was removed from the desired template is just as much a difference as one
/// that was added, since applying the desired template would delete the corresponding
/// resource or permission. Arrays are compared positionally.
///
/// An empty result means that submitting the desired template as a stack update would be a
/// no-op.
pub fn compare_templates<'a>(deployed: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, deployed, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    deployed: &'a Value,
    desired: &'a Value,
) {
    match (deployed, desired) {
        (Value::Object(ref deployed_map), Value::Object(ref desired_map)) => {
            compare_objects(diffs, path, deployed_map, desired_map);
        }
        (Value::Array(ref deployed_array), Value::Array(ref desired_array)) => {
            compare_arrays(diffs, path, deployed_array, desired_array);
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn compare_objects<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    deployed: &'a JsonObject,
    desired: &'a JsonObject,
) {
    for (key, desired_val) in desired.iter() {
        path.push(Segment::Key(key));
        match deployed.get(key) {
            Some(deployed_val) => compare(diffs, path, deployed_val, desired_val),
            None => diffs.push(diff(&*path, &Value::Null, desired_val)),
        }
        path.pop();
    }
    for (key, deployed_val) in deployed.iter() {
        if !desired.contains_key(key) {
            path.push(Segment::Key(key));
            diffs.push(diff(&*path, deployed_val, &Value::Null));
            path.pop();
        }
    }
}

fn compare_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    deployed: &'a [Value],
    desired: &'a [Value],
) {
    let len = deployed.len().max(desired.len());
    for i in 0..len {
        path.push(Segment::Index(i));
        match (deployed.get(i), desired.get(i)) {
            (Some(d), Some(w)) => compare(diffs, path, d, w),
            (None, Some(w)) => diffs.push(diff(&*path, &Value::Null, w)),
            (Some(d), None) => diffs.push(diff(&*path, d, &Value::Null)),
            (None, None) => {}
        }
        path.pop();
    }
}

fn diff<'a>(path: &[Segment], deployed: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(8);
    for s in path.iter() {
        p.push('.');
        match s {
            Segment::Key(ref k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        deployed,
        desired,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn identical_templates_have_no_diffs() {
        let template = json!({
            "Resources": {
                "Role1": {
                    "Type": "AWS::IAM::Role",
                    "Properties": { "ManagedPolicyArns": ["arn:a", "arn:b"] }
                }
            }
        });
        let diffs = compare_templates(&template, &template);
        assert!(diffs.is_empty(), "expected no diffs, got: {}", diffs);
    }

    #[test]
    fn returns_diffs_in_both_directions() {
        let deployed = json!({
            "Resources": {
                "Role1": { "Properties": { "ManagedPolicyArns": ["arn:a", "arn:b"] } },
                "Policy1": { "Type": "AWS::IAM::Policy" }
            },
            "Description": "same"
        });
        let desired = json!({
            "Resources": {
                "Role1": { "Properties": { "ManagedPolicyArns": ["arn:c"] } }
            },
            "Description": "same"
        });

        let diffs = compare_templates(&deployed, &desired);
        let arn_a = json!("arn:a");
        let arn_b = json!("arn:b");
        let arn_c = json!("arn:c");
        let policy = json!({ "Type": "AWS::IAM::Policy" });

        let expected = vec![
            Diff {
                path: ".Resources.Role1.Properties.ManagedPolicyArns.0".to_owned(),
                deployed: &arn_a,
                desired: &arn_c,
            },
            Diff {
                path: ".Resources.Role1.Properties.ManagedPolicyArns.1".to_owned(),
                deployed: &arn_b,
                desired: &Value::Null,
            },
            Diff {
                path: ".Resources.Policy1".to_owned(),
                deployed: &policy,
                desired: &Value::Null,
            },
        ];
        assert_all_diffs_present(expected, diffs);
    }

    fn assert_all_diffs_present(expected: Vec<Diff>, mut actual: Diffs) {
        for expected_diff in expected.iter() {
            if !actual.0.contains(expected_diff) {
                panic!(
                    "Expected to find diff: {} in actual diffs: {}",
                    expected_diff, actual
                );
            }
        }
        actual.0.retain(|e| !expected.contains(e));
        if !actual.is_empty() {
            panic!(
                "Expected {} diffs but found {} extra, \nextra_diffs: {}\nexpected: {}",
                expected.len(),
                actual.len(),
                actual,
                Diffs(expected)
            );
        }
    }
}
