//! Renders the IAM role templates that back add-ons and service accounts. Everything in here is
//! pure: the same input always renders to the same `TemplateBody`, which is what allows stack
//! updates to be skipped when nothing has changed.
use crate::error::ReconcileError;
use crate::stack::TemplateBody;

use serde_json::{json, Map, Value};

pub const ROLE_RESOURCE: &str = "Role1";
pub const POLICY_RESOURCE: &str = "Policy1";
pub const ROLE_ARN_OUTPUT: &str = "Role1";

const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";
const POLICY_DOCUMENT_VERSION: &str = "2012-10-17";
const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// The identity federation that the role trusts. The issuer is stored without its scheme,
/// since that is how it appears in trust policy condition keys.
#[derive(Debug, Clone, PartialEq)]
pub struct OidcBinding {
    pub provider_arn: String,
    pub issuer: String,
}

impl OidcBinding {
    /// Builds the binding from the issuer url reported by the control plane, like
    /// `https://oidc.eks.us-west-2.amazonaws.com/id/ABC123`
    pub fn from_issuer_url(issuer_url: &str, account_id: &str) -> Result<OidcBinding, ReconcileError> {
        let issuer = issuer_url
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_owned();
        if issuer.is_empty() || account_id.is_empty() {
            return Err(ReconcileError::validation(format!(
                "cannot derive OIDC provider from issuer {:?} and account {:?}",
                issuer_url, account_id
            )));
        }
        let provider_arn = format!("arn:aws:iam::{}:oidc-provider/{}", account_id, issuer);
        Ok(OidcBinding {
            provider_arn,
            issuer,
        })
    }
}

/// Where the role's permissions come from. Policy ARNs take precedence over an inline document.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicySource {
    Arns(Vec<String>),
    Document(Value),
}

impl PolicySource {
    /// Picks the variant from whichever input is non-empty. Returns `None` if both are empty.
    pub fn select(arns: &[String], document: Option<&Value>) -> Option<PolicySource> {
        if !arns.is_empty() {
            Some(PolicySource::Arns(arns.to_vec()))
        } else {
            document
                .filter(|d| !d.is_null())
                .map(|d| PolicySource::Document(d.clone()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleTemplateInput<'a> {
    /// The add-on or service account that the role belongs to
    pub resource_name: &'a str,
    /// The Kubernetes service account that may assume the role, if it is known
    pub service_account: Option<(&'a str, &'a str)>,
    pub attach_policy_arns: &'a [String],
    pub attach_policy: Option<&'a Value>,
    pub oidc: &'a OidcBinding,
}

/// Renders an IAM role template that is trust-bound to the given identity. When the namespace
/// and service account are known, the trust policy is restricted to exactly that subject.
/// Otherwise any subject with the right audience may assume the role.
pub fn build_iam_role_template(input: &RoleTemplateInput) -> Result<TemplateBody, ReconcileError> {
    let policy = PolicySource::select(input.attach_policy_arns, input.attach_policy).ok_or_else(|| {
        ReconcileError::validation(format!(
            "{:?} requires either attachPolicyARNs or attachPolicy to create an IAM role",
            input.resource_name
        ))
    })?;
    let template = render(input, &policy);
    Ok(TemplateBody::from_value(&template))
}

fn render(input: &RoleTemplateInput, policy: &PolicySource) -> Value {
    let mut role_properties = Map::new();
    role_properties.insert(
        "AssumeRolePolicyDocument".to_owned(),
        assume_role_policy(input.oidc, input.service_account),
    );

    let mut resources = Map::new();
    match policy {
        PolicySource::Arns(arns) => {
            role_properties.insert("ManagedPolicyArns".to_owned(), json!(arns));
        }
        PolicySource::Document(document) => {
            resources.insert(
                POLICY_RESOURCE.to_owned(),
                json!({
                    "Type": "AWS::IAM::Policy",
                    "Properties": {
                        "PolicyName": { "Fn::Sub": format!("${{AWS::StackName}}-{}", POLICY_RESOURCE) },
                        "PolicyDocument": document,
                        "Roles": [ { "Ref": ROLE_RESOURCE } ],
                    }
                }),
            );
        }
    }
    resources.insert(
        ROLE_RESOURCE.to_owned(),
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": Value::Object(role_properties),
        }),
    );

    json!({
        "AWSTemplateFormatVersion": TEMPLATE_FORMAT_VERSION,
        "Description": format!("IAM role for {:?} [created and managed by stackctl]", input.resource_name),
        "Resources": Value::Object(resources),
        "Outputs": {
            ROLE_ARN_OUTPUT: {
                "Value": { "Fn::GetAtt": format!("{}.Arn", ROLE_RESOURCE) }
            }
        }
    })
}

fn assume_role_policy(oidc: &OidcBinding, service_account: Option<(&str, &str)>) -> Value {
    let mut string_equals = Map::new();
    string_equals.insert(format!("{}:aud", oidc.issuer), json!(STS_AUDIENCE));
    if let Some((namespace, name)) = service_account {
        string_equals.insert(
            format!("{}:sub", oidc.issuer),
            json!(format!("system:serviceaccount:{}:{}", namespace, name)),
        );
    }
    json!({
        "Version": POLICY_DOCUMENT_VERSION,
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["sts:AssumeRoleWithWebIdentity"],
                "Principal": { "Federated": oidc.provider_arn },
                "Condition": { "StringEquals": Value::Object(string_equals) },
            }
        ]
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn oidc() -> OidcBinding {
        OidcBinding::from_issuer_url("https://oidc.eks.us-west-2.amazonaws.com/id/ABC", "123456789012")
            .unwrap()
    }

    #[test]
    fn derives_provider_arn_from_issuer() {
        let binding = oidc();
        assert_eq!("oidc.eks.us-west-2.amazonaws.com/id/ABC", binding.issuer);
        assert_eq!(
            "arn:aws:iam::123456789012:oidc-provider/oidc.eks.us-west-2.amazonaws.com/id/ABC",
            binding.provider_arn
        );
        assert!(OidcBinding::from_issuer_url("https://", "123").is_err());
    }

    #[test]
    fn renders_managed_policy_arns() {
        let binding = oidc();
        let arns = vec!["arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy".to_owned()];
        let input = RoleTemplateInput {
            resource_name: "vpc-cni",
            service_account: Some(("kube-system", "aws-node")),
            attach_policy_arns: &arns,
            attach_policy: None,
            oidc: &binding,
        };
        let body = build_iam_role_template(&input).unwrap();
        let template = body.parse().unwrap();

        let role = &template["Resources"]["Role1"];
        assert_eq!("AWS::IAM::Role", role["Type"]);
        assert_eq!(json!(arns), role["Properties"]["ManagedPolicyArns"]);
        let condition = &role["Properties"]["AssumeRolePolicyDocument"]["Statement"][0]["Condition"]["StringEquals"];
        assert_eq!(
            "system:serviceaccount:kube-system:aws-node",
            condition["oidc.eks.us-west-2.amazonaws.com/id/ABC:sub"]
        );
        assert!(template["Resources"].get("Policy1").is_none());
        assert_eq!(json!({"Fn::GetAtt": "Role1.Arn"}), template["Outputs"]["Role1"]["Value"]);
    }

    #[test]
    fn renders_inline_policy_document_without_known_subject() {
        let binding = oidc();
        let document = json!({
            "Version": "2012-10-17",
            "Statement": [{"Effect": "Allow", "Action": ["s3:GetObject"], "Resource": "*"}]
        });
        let input = RoleTemplateInput {
            resource_name: "coredns",
            service_account: None,
            attach_policy_arns: &[],
            attach_policy: Some(&document),
            oidc: &binding,
        };
        let template = build_iam_role_template(&input).unwrap().parse().unwrap();
        assert_eq!(document, template["Resources"]["Policy1"]["Properties"]["PolicyDocument"]);
        assert!(template["Resources"]["Role1"]["Properties"]
            .get("ManagedPolicyArns")
            .is_none());
        let condition = &template["Resources"]["Role1"]["Properties"]["AssumeRolePolicyDocument"]
            ["Statement"][0]["Condition"]["StringEquals"];
        assert_eq!(1, condition.as_object().unwrap().len());
    }

    #[test]
    fn arns_take_precedence_over_document() {
        let arns = vec!["arn:a".to_owned()];
        let document = json!({"Statement": []});
        assert_eq!(
            Some(PolicySource::Arns(arns.clone())),
            PolicySource::select(&arns, Some(&document))
        );
        assert_eq!(None, PolicySource::select(&[], Some(&Value::Null)));
    }

    #[test]
    fn empty_policy_inputs_are_a_validation_error() {
        let binding = oidc();
        let input = RoleTemplateInput {
            resource_name: "coredns",
            service_account: None,
            attach_policy_arns: &[],
            attach_policy: None,
            oidc: &binding,
        };
        let err = build_iam_role_template(&input).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn output_is_deterministic() {
        let binding = oidc();
        let arns = vec!["arn:b".to_owned(), "arn:a".to_owned()];
        let input = RoleTemplateInput {
            resource_name: "vpc-cni",
            service_account: Some(("kube-system", "aws-node")),
            attach_policy_arns: &arns,
            attach_policy: None,
            oidc: &binding,
        };
        let first = build_iam_role_template(&input).unwrap();
        let second = build_iam_role_template(&input.clone()).unwrap();
        assert_eq!(first, second);
    }
}
