use std::fmt;

use crate::UpstreamModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    Logical,
    Summary,
    CodeBeginner,
    CodeAdvanced,
}

impl Template {
    /// Listing order. Suffix matching walks this list too; the two `code-*` names go first
    /// because they are the only suffixes that themselves contain a dash.
    pub const ALL: [Template; 4] =
        [Template::CodeBeginner, Template::CodeAdvanced, Template::Logical, Template::Summary];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logical => "logical",
            Self::Summary => "summary",
            Self::CodeBeginner => "code-beginner",
            Self::CodeAdvanced => "code-advanced",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|template| template.as_str().eq_ignore_ascii_case(raw))
    }

    fn supported_list() -> String {
        Self::ALL.iter().map(|template| template.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ModelResolutionError {
    #[error("unsupported model: {model}")]
    UnsupportedModel { model: String },
    #[error("unsupported template: {template} (supported templates: {supported})")]
    UnsupportedTemplate { template: String, supported: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub upstream_model: String,
    pub template: Option<Template>,
}

/// Maps client-facing model names onto what the upstream expects, and builds the advertised
/// model list from whatever the upstream reports.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, model: &str) -> Result<ResolvedModel, ModelResolutionError>;

    fn catalog(&self, upstream: &[UpstreamModel]) -> Vec<String>;

    /// Used when the upstream model list cannot be fetched.
    fn fallback_catalog(&self) -> Vec<String>;
}

/// `<prefix>[ ...][-<template>]` names, e.g. `Dolphin 24B-summary`.
#[derive(Debug, Clone)]
pub struct AliasTemplateResolver {
    prefix: String,
    upstream_model: String,
    display_name: String,
    default_template: Template,
}

impl AliasTemplateResolver {
    pub fn new(
        prefix: impl Into<String>,
        upstream_model: impl Into<String>,
        display_name: impl Into<String>,
        default_template: Template,
    ) -> Self {
        Self {
            prefix: prefix.into().to_ascii_lowercase(),
            upstream_model: upstream_model.into(),
            display_name: display_name.into(),
            default_template,
        }
    }

    fn expand(label: &str) -> impl Iterator<Item = String> + '_ {
        std::iter::once(label.to_string())
            .chain(Template::ALL.into_iter().map(move |template| format!("{label}-{template}")))
    }
}

impl ModelResolver for AliasTemplateResolver {
    fn resolve(&self, model: &str) -> Result<ResolvedModel, ModelResolutionError> {
        let lowered = model.trim().to_ascii_lowercase();
        if !lowered.starts_with(&self.prefix) {
            return Err(ModelResolutionError::UnsupportedModel { model: model.to_string() });
        }

        let matched = Template::ALL
            .into_iter()
            .find(|template| lowered.ends_with(&format!("-{}", template.as_str())));
        let template = match (matched, model.split_once('-')) {
            (Some(template), _) => template,
            (None, Some((_, suffix))) => {
                return Err(ModelResolutionError::UnsupportedTemplate {
                    template: suffix.to_string(),
                    supported: Template::supported_list(),
                });
            }
            (None, None) => self.default_template,
        };

        Ok(ResolvedModel { upstream_model: self.upstream_model.clone(), template: Some(template) })
    }

    fn catalog(&self, upstream: &[UpstreamModel]) -> Vec<String> {
        upstream.iter().flat_map(|model| Self::expand(model.label()).collect::<Vec<_>>()).collect()
    }

    fn fallback_catalog(&self) -> Vec<String> {
        Self::expand(&self.display_name).collect()
    }
}

/// Accepts any model name and always targets one upstream model.
#[derive(Debug, Clone)]
pub struct FixedModelResolver {
    upstream_model: String,
    display_name: String,
}

impl FixedModelResolver {
    pub fn new(upstream_model: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { upstream_model: upstream_model.into(), display_name: display_name.into() }
    }
}

impl ModelResolver for FixedModelResolver {
    fn resolve(&self, _model: &str) -> Result<ResolvedModel, ModelResolutionError> {
        Ok(ResolvedModel { upstream_model: self.upstream_model.clone(), template: None })
    }

    fn catalog(&self, upstream: &[UpstreamModel]) -> Vec<String> {
        upstream.iter().map(|model| model.label().to_string()).collect()
    }

    fn fallback_catalog(&self) -> Vec<String> {
        vec![self.display_name.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ResolveFixture<'a> {
        name: &'a str,
        model: &'a str,
        default_template: Template,
    }

    impl<'a> ResolveFixture<'a> {
        fn parse(raw: &'a str) -> Self {
            let mut fixture =
                Self { name: "unnamed", model: "Dolphin 24B", default_template: Template::Logical };

            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                match key.trim() {
                    "name" => fixture.name = value.trim(),
                    "model" => fixture.model = value.trim(),
                    "default_template" => {
                        fixture.default_template = Template::parse(value).unwrap_or_else(|| {
                            panic!("unsupported template fixture value: {value}")
                        })
                    }
                    other => panic!("unsupported fixture key: {other}"),
                }
            }

            fixture
        }
    }

    fn assert_snapshot(name: &str, actual: &str, expected: &str) {
        let actual = actual.trim();
        let expected = expected.trim();
        assert_eq!(
            actual, expected,
            "snapshot mismatch for fixture `{name}`\n\nactual:\n{actual}\n\nexpected:\n{expected}"
        );
    }

    fn render(result: Result<ResolvedModel, ModelResolutionError>) -> String {
        match result {
            Ok(resolved) => format!(
                "kind=ok\nupstream={}\ntemplate={}",
                resolved.upstream_model,
                resolved.template.map(Template::as_str).unwrap_or("<none>")
            ),
            Err(ModelResolutionError::UnsupportedModel { model }) => {
                format!("kind=err\nerror_kind=UnsupportedModel\nmodel={model}")
            }
            Err(ModelResolutionError::UnsupportedTemplate { template, .. }) => {
                format!("kind=err\nerror_kind=UnsupportedTemplate\ntemplate={template}")
            }
        }
    }

    #[test]
    fn alias_template_resolution_fixtures() {
        let fixtures = [
            (
                r#"
name=summary_suffix
model=Dolphin 24B-summary
"#,
                r#"
kind=ok
upstream=dolphinpod:24B
template=summary
"#,
            ),
            (
                r#"
name=case_insensitive_prefix_and_suffix
model=DOLPHIN 24B-Code-Advanced
"#,
                r#"
kind=ok
upstream=dolphinpod:24B
template=code-advanced
"#,
            ),
            (
                r#"
name=dashed_template_wins_over_partial_match
model=dolphin-code-beginner
"#,
                r#"
kind=ok
upstream=dolphinpod:24B
template=code-beginner
"#,
            ),
            (
                r#"
name=no_suffix_uses_default
model=Dolphin 24B
default_template=summary
"#,
                r#"
kind=ok
upstream=dolphinpod:24B
template=summary
"#,
            ),
            (
                r#"
name=unknown_suffix_names_the_suffix
model=Dolphin 24B-poetry
"#,
                r#"
kind=err
error_kind=UnsupportedTemplate
template=poetry
"#,
            ),
            (
                r#"
name=partial_dashed_suffix_is_unknown
model=dolphin-code
"#,
                r#"
kind=err
error_kind=UnsupportedTemplate
template=code
"#,
            ),
            (
                r#"
name=wrong_prefix_names_the_model
model=gpt-4o-summary
"#,
                r#"
kind=err
error_kind=UnsupportedModel
model=gpt-4o-summary
"#,
            ),
        ];

        for (raw, expected) in fixtures {
            let fixture = ResolveFixture::parse(raw);
            let resolver = AliasTemplateResolver::new(
                "dolphin",
                "dolphinpod:24B",
                "Dolphin 24B",
                fixture.default_template,
            );
            let actual = render(resolver.resolve(fixture.model));
            assert_snapshot(fixture.name, &actual, expected);
        }
    }

    #[test]
    fn alias_catalog_is_bare_label_plus_every_template() {
        let resolver = AliasTemplateResolver::new(
            "dolphin",
            "dolphinpod:24B",
            "Dolphin 24B",
            Template::Logical,
        );
        let upstream = [UpstreamModel {
            id: "dolphinpod:24B".to_string(),
            name: Some("Dolphin 24B".to_string()),
        }];

        let catalog = resolver.catalog(&upstream);
        assert_eq!(
            catalog,
            vec![
                "Dolphin 24B",
                "Dolphin 24B-code-beginner",
                "Dolphin 24B-code-advanced",
                "Dolphin 24B-logical",
                "Dolphin 24B-summary",
            ]
        );
        assert_eq!(resolver.fallback_catalog(), catalog);
        for id in &catalog {
            assert!(resolver.resolve(id).is_ok(), "catalog entry `{id}` must resolve");
        }
    }

    #[test]
    fn fixed_resolver_passes_any_model_through() {
        let resolver = FixedModelResolver::new("0727-360B-API", "GLM-4.5");
        let resolved = resolver.resolve("anything-at-all").expect("fixed resolver never rejects");
        assert_eq!(resolved.upstream_model, "0727-360B-API");
        assert_eq!(resolved.template, None);

        let upstream = [
            UpstreamModel { id: "glm-4.5".to_string(), name: Some("GLM-4.5".to_string()) },
            UpstreamModel { id: "glm-4.5v".to_string(), name: None },
        ];
        assert_eq!(resolver.catalog(&upstream), vec!["GLM-4.5", "glm-4.5v"]);
        assert_eq!(resolver.fallback_catalog(), vec!["GLM-4.5"]);
    }
}
