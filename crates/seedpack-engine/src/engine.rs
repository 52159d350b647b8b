//! Template engine based on MiniJinja

use minijinja::Environment;
use seedpack_core::{Chart, TemplateContext};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::functions;

const NOTES_FILE: &str = "NOTES.txt";

/// A chart rendered for one release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedChart {
    /// Release name
    pub name: String,

    /// Release namespace
    pub namespace: String,

    /// Rendered manifests keyed by `<chart>/templates/<file>`
    pub files: BTreeMap<String, String>,

    /// Rendered NOTES.txt, if the chart has one
    pub notes: Option<String>,
}

impl RenderedChart {
    /// Manifests as secret data, with `/` in file names replaced by `_`
    ///
    /// Fails when two paths flatten to the same key.
    pub fn as_secret_data(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut data = BTreeMap::new();
        let mut sources: BTreeMap<String, &str> = BTreeMap::new();

        for (path, content) in &self.files {
            let key = path.replace('/', "_");
            if let Some(first) = sources.insert(key.clone(), path) {
                return Err(EngineError::SecretKeyCollision {
                    key,
                    first: first.to_string(),
                    second: path.clone(),
                });
            }
            data.insert(key, content.as_bytes().to_vec());
        }

        Ok(data)
    }

    /// All manifests as a single multi-document stream
    pub fn manifest(&self) -> String {
        let mut out = String::new();
        for (path, content) in &self.files {
            out.push_str("---\n# Source: ");
            out.push_str(path);
            out.push('\n');
            out.push_str(content.trim_end());
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create a configured MiniJinja environment
    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        if self.strict_mode {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        } else {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        }

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("haskey", filters::haskey);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);
        env.add_filter("semver_match", filters::semver_match);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("list", functions::list);
        env.add_function("get", functions::get);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);

        env
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &TemplateContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        tmpl.render(context_value(context))
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template).into())
    }

    /// Render every template of a chart
    ///
    /// Templates are addressable by their path below `templates/`, so helpers
    /// can be imported with `{% import "_helpers.tpl" as helpers %}`. Files
    /// whose name starts with `_` are never rendered on their own, and
    /// templates rendering to nothing are dropped.
    pub fn render_chart(&self, chart: &Chart, context: &TemplateContext) -> Result<RenderedChart> {
        let mut env = self.create_environment();

        let sources: BTreeMap<String, &str> = chart
            .templates
            .iter()
            .map(|(path, source)| (template_name(path), source.as_str()))
            .collect();

        for (name, source) in &sources {
            env.add_template_owned(name.clone(), (*source).to_string())
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;
        }

        let ctx = context_value(context);
        let mut files = BTreeMap::new();
        let mut notes = None;

        for (name, source) in &sources {
            if is_helper(name) {
                continue;
            }

            let tmpl = env
                .get_template(name)
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;
            let rendered = tmpl
                .render(&ctx)
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;

            if name == NOTES_FILE {
                notes = Some(rendered);
                continue;
            }

            let trimmed = rendered.trim();
            if trimmed.is_empty() || trimmed == "---" {
                continue;
            }

            check_yaml(name, &rendered)?;
            files.insert(format!("{}/templates/{}", chart.name(), name), rendered);
        }

        Ok(RenderedChart {
            name: context.release.name.clone(),
            namespace: context.release.namespace.clone(),
            files,
            notes,
        })
    }
}

fn context_value(context: &TemplateContext) -> minijinja::Value {
    minijinja::context! {
        values => &context.values,
        release => &context.release,
        chart => &context.chart,
        capabilities => &context.capabilities,
    }
}

fn template_name(chart_path: &str) -> String {
    chart_path
        .strip_prefix("templates/")
        .unwrap_or(chart_path)
        .to_string()
}

fn is_helper(name: &str) -> bool {
    name.rsplit('/').next().is_some_and(|file| file.starts_with('_'))
}

/// Reject output that is not a YAML document stream
fn check_yaml(name: &str, rendered: &str) -> Result<()> {
    for document in serde_yaml::Deserializer::from_str(rendered) {
        serde_yaml::Value::deserialize(document).map_err(|source| EngineError::Manifest {
            template: name.to_string(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedpack_core::{ChartMetadata, ReleaseInfo, Values};
    use semver::Version;

    fn chart(templates: &[(&str, &str)]) -> Chart {
        Chart {
            metadata: ChartMetadata {
                name: "provider-test".to_string(),
                version: Version::new(0, 1, 0),
                description: None,
                app_version: None,
            },
            values: Values::from_yaml("replicas: 1\nimage:\n  tag: v1\n").unwrap(),
            templates: templates
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn context(chart: &Chart, values: &str) -> TemplateContext {
        let values = chart.values.clone().overlaid(&Values::from_yaml(values).unwrap());
        let release = ReleaseInfo::for_install("provider-test", "extension-provider-test");
        TemplateContext::new(values, release, &chart.metadata)
    }

    #[test]
    fn test_render_simple() {
        let engine = Engine::default();
        let c = chart(&[]);
        let ctx = context(&c, "replicas: 3");

        let result = engine.render_string("replicas: {{ values.replicas }}", &ctx, "t.yaml").unwrap();
        assert_eq!(result, "replicas: 3");
    }

    #[test]
    fn test_render_chart_with_helpers() {
        let engine = Engine::default();
        let c = chart(&[
            ("templates/_helpers.tpl", "{% macro fullname(name) %}{{ name }}-controller{% endmacro %}"),
            (
                "templates/deployment.yaml",
                "{% import \"_helpers.tpl\" as h -%}\nname: {{ h.fullname(release.name) }}\nnamespace: {{ release.namespace }}\ntag: {{ values.image.tag }}\n",
            ),
            ("templates/NOTES.txt", "installed {{ chart.name }}"),
            ("templates/disabled.yaml", "{% if values.enabled | default(false) %}kind: X{% endif %}"),
        ]);
        let ctx = context(&c, "image:\n  tag: v2\n");

        let rendered = engine.render_chart(&c, &ctx).unwrap();

        assert_eq!(rendered.name, "provider-test");
        assert_eq!(rendered.namespace, "extension-provider-test");
        assert_eq!(rendered.notes.as_deref(), Some("installed provider-test"));
        assert_eq!(
            rendered.files.keys().collect::<Vec<_>>(),
            vec!["provider-test/templates/deployment.yaml"]
        );
        insta::assert_snapshot!(rendered.manifest(), @r"
        ---
        # Source: provider-test/templates/deployment.yaml
        name: provider-test-controller
        namespace: extension-provider-test
        tag: v2
        ");
    }

    #[test]
    fn test_secret_data_keys() {
        let engine = Engine::default();
        let c = chart(&[("templates/rbac/role.yaml", "kind: Role\n")]);
        let ctx = context(&c, "");

        let data = engine.render_chart(&c, &ctx).unwrap().as_secret_data().unwrap();

        assert_eq!(
            data.keys().collect::<Vec<_>>(),
            vec!["provider-test_templates_rbac_role.yaml"]
        );
        assert_eq!(data["provider-test_templates_rbac_role.yaml"], b"kind: Role".to_vec());
    }

    #[test]
    fn test_secret_data_key_collision() {
        let engine = Engine::default();
        let c = chart(&[
            ("templates/a_b/c.yaml", "kind: A\n"),
            ("templates/a/b_c.yaml", "kind: B\n"),
        ]);
        let ctx = context(&c, "");

        let rendered = engine.render_chart(&c, &ctx).unwrap();
        assert_eq!(rendered.files.len(), 2);

        match rendered.as_secret_data().unwrap_err() {
            EngineError::SecretKeyCollision { key, first, second } => {
                assert_eq!(key, "provider-test_templates_a_b_c.yaml");
                assert_eq!(first, "provider-test/templates/a/b_c.yaml");
                assert_eq!(second, "provider-test/templates/a_b/c.yaml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_undefined_error() {
        let engine = Engine::default();
        let c = chart(&[("templates/cm.yaml", "value: {{ values.undefined_key.nested }}")]);
        let ctx = context(&c, "");

        let err = engine.render_chart(&c, &ctx).unwrap_err();
        assert!(matches!(err, EngineError::Template(ref t) if t.template == "cm.yaml"));
    }

    #[test]
    fn test_invalid_yaml_output() {
        let engine = Engine::default();
        let c = chart(&[("templates/bad.yaml", "a: [unclosed\n")]);
        let ctx = context(&c, "");

        assert!(matches!(
            engine.render_chart(&c, &ctx),
            Err(EngineError::Manifest { .. })
        ));
    }
}
