//! Declarative schema validation for `_behaviors`.
//!
//! Each behavior key maps to a field spec describing whether it is required,
//! which JSON types it may take and the constraints per type. List-valued
//! behaviors (`copy`, `lookup`, `shellTransform`) validate every element on
//! its own, and errors for an element carry that element as their source.

use crate::error::ImposterError;
use serde_json::Value;

/// Constraint on a numeric field.
#[derive(Clone, Copy)]
enum NumberRule {
    NonNegative,
    Positive,
}

#[derive(Clone, Copy)]
enum Allowed {
    Number(Option<NumberRule>),
    String(Option<&'static [&'static str]>),
    Object {
        single_key: bool,
        one_of: Option<&'static [&'static str]>,
    },
}

impl Allowed {
    fn type_name(&self) -> &'static str {
        match self {
            Allowed::Number(_) => "number",
            Allowed::String(_) => "string",
            Allowed::Object { .. } => "object",
        }
    }

    fn article(&self) -> &'static str {
        match self {
            Allowed::Object { .. } => "an",
            _ => "a",
        }
    }
}

struct Field {
    name: &'static str,
    required: bool,
    allowed: &'static [Allowed],
    context: Option<&'static str>,
    /// Checked when the value is an object
    children: &'static [Field],
}

const PLAIN_OBJECT: Allowed = Allowed::Object {
    single_key: false,
    one_of: None,
};

const FROM: Field = Field {
    name: "from",
    required: true,
    allowed: &[
        Allowed::String(None),
        Allowed::Object {
            single_key: true,
            one_of: None,
        },
    ],
    context: Some("the request field to select from"),
    children: &[],
};

const INTO: Field = Field {
    name: "into",
    required: true,
    allowed: &[Allowed::String(None)],
    context: Some("the token to replace in response fields"),
    children: &[],
};

const USING: Field = Field {
    name: "using",
    required: true,
    allowed: &[PLAIN_OBJECT],
    context: None,
    children: &[
        Field {
            name: "method",
            required: true,
            allowed: &[Allowed::String(Some(&["regex", "xpath", "jsonpath"]))],
            context: None,
            children: &[],
        },
        Field {
            name: "selector",
            required: true,
            allowed: &[Allowed::String(None)],
            context: None,
            children: &[],
        },
    ],
};

const WAIT: Field = Field {
    name: "wait",
    required: true,
    allowed: &[
        Allowed::Number(Some(NumberRule::NonNegative)),
        Allowed::String(None),
        PLAIN_OBJECT,
    ],
    context: Some("the number of milliseconds to wait"),
    children: &[
        Field {
            name: "min",
            required: true,
            allowed: &[Allowed::Number(Some(NumberRule::NonNegative))],
            context: None,
            children: &[],
        },
        Field {
            name: "max",
            required: true,
            allowed: &[Allowed::Number(Some(NumberRule::NonNegative))],
            context: None,
            children: &[],
        },
    ],
};

const REPEAT: Field = Field {
    name: "repeat",
    required: true,
    allowed: &[Allowed::Number(Some(NumberRule::Positive))],
    context: Some("the number of times to repeat the response"),
    children: &[],
};

const COPY: Field = Field {
    name: "copy",
    required: true,
    allowed: &[PLAIN_OBJECT],
    context: None,
    children: &[FROM, INTO, USING],
};

const LOOKUP: Field = Field {
    name: "lookup",
    required: true,
    allowed: &[PLAIN_OBJECT],
    context: None,
    children: &[
        Field {
            name: "key",
            required: true,
            allowed: &[PLAIN_OBJECT],
            context: None,
            children: &[
                FROM,
                USING,
                Field {
                    name: "index",
                    required: false,
                    allowed: &[Allowed::Number(Some(NumberRule::NonNegative))],
                    context: None,
                    children: &[],
                },
            ],
        },
        Field {
            name: "fromDataSource",
            required: true,
            allowed: &[Allowed::Object {
                single_key: true,
                one_of: Some(&["csv"]),
            }],
            context: None,
            children: &[Field {
                name: "csv",
                required: false,
                allowed: &[PLAIN_OBJECT],
                context: None,
                children: &[
                    Field {
                        name: "path",
                        required: true,
                        allowed: &[Allowed::String(None)],
                        context: Some("the path to the CSV file"),
                        children: &[],
                    },
                    Field {
                        name: "keyColumn",
                        required: true,
                        allowed: &[Allowed::String(None)],
                        context: Some("the column header to select against the \"key\" field"),
                        children: &[],
                    },
                    Field {
                        name: "delimiter",
                        required: false,
                        allowed: &[Allowed::String(None)],
                        context: Some("the delimiter separating values in the CSV file"),
                        children: &[],
                    },
                ],
            }],
        },
        INTO,
    ],
};

const SHELL_TRANSFORM: Field = Field {
    name: "shellTransform",
    required: true,
    allowed: &[Allowed::String(None)],
    context: Some("the path to a command line application"),
    children: &[],
};

const DECORATE: Field = Field {
    name: "decorate",
    required: true,
    allowed: &[Allowed::String(None)],
    context: Some("a JavaScript function"),
    children: &[],
};

/// How a behavior's value is laid out.
enum Shape {
    Single(&'static Field),
    Each(&'static Field),
}

fn shape_for(key: &str) -> Option<Shape> {
    match key {
        "wait" => Some(Shape::Single(&WAIT)),
        "repeat" => Some(Shape::Single(&REPEAT)),
        "decorate" => Some(Shape::Single(&DECORATE)),
        "copy" => Some(Shape::Each(&COPY)),
        "lookup" => Some(Shape::Each(&LOOKUP)),
        "shellTransform" => Some(Shape::Each(&SHELL_TRANSFORM)),
        _ => None,
    }
}

/// Collects errors for one behavior key.
struct Reporter<'a> {
    behavior: &'a str,
    source: &'a Value,
    errors: &'a mut Vec<ImposterError>,
}

impl Reporter<'_> {
    fn add(&mut self, path: &str, message: impl AsRef<str>) {
        self.errors.push(ImposterError::validation_with_source(
            format!("{} behavior \"{path}\" field {}", self.behavior, message.as_ref()),
            self.source.clone(),
        ));
    }
}

/// Validate a `_behaviors` object, returning every problem found.
pub fn validate(config: Option<&Value>) -> Vec<ImposterError> {
    let mut errors = Vec::new();
    let Some(config) = config else {
        return errors;
    };
    let Some(object) = config.as_object() else {
        errors.push(ImposterError::validation_with_source(
            "_behaviors must be an object",
            config.clone(),
        ));
        return errors;
    };

    for (key, value) in object {
        match shape_for(key) {
            Some(Shape::Single(field)) => {
                let mut reporter = Reporter {
                    behavior: key,
                    source: config,
                    errors: &mut errors,
                };
                check_field(field, Some(value), key, key, &mut reporter);
            }
            Some(Shape::Each(field)) => {
                let elements: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for element in elements {
                    let mut reporter = Reporter {
                        behavior: key,
                        source: element,
                        errors: &mut errors,
                    };
                    check_field(field, Some(element), key, "", &mut reporter);
                }
            }
            None => errors.push(ImposterError::validation_with_source(
                format!("Unrecognized behavior: \"{key}\""),
                Value::String(key.clone()),
            )),
        }
    }
    errors
}

/// Check one field. `path` names it in messages; `child_prefix` is
/// prepended to its children's names.
fn check_field(
    field: &Field,
    value: Option<&Value>,
    path: &str,
    child_prefix: &str,
    reporter: &mut Reporter<'_>,
) {
    let value = match value {
        Some(value) if !value.is_null() => value,
        _ => {
            if field.required {
                reporter.add(path, "required");
            }
            return;
        }
    };

    let Some(allowed) = field.allowed.iter().find(|a| matches_type(a, value)) else {
        reporter.add(path, type_error_message(field));
        return;
    };

    if let Some(message) = constraint_error(allowed, value) {
        reporter.add(path, message);
        return;
    }

    if let Value::Object(object) = value {
        for child in field.children {
            let child_path = if child_prefix.is_empty() {
                child.name.to_string()
            } else {
                format!("{child_prefix}.{}", child.name)
            };
            check_field(child, object.get(child.name), &child_path, &child_path, reporter);
        }
    }
}

fn matches_type(allowed: &Allowed, value: &Value) -> bool {
    matches!(
        (allowed, value),
        (Allowed::Number(_), Value::Number(_))
            | (Allowed::String(_), Value::String(_))
            | (Allowed::Object { .. }, Value::Object(_))
    )
}

fn type_error_message(field: &Field) -> String {
    let types = field
        .allowed
        .iter()
        .map(|a| format!("{} {}", a.article(), a.type_name()))
        .collect::<Vec<_>>()
        .join(" or ");
    match field.context {
        Some(context) => format!("must be {types}, representing {context}"),
        None => format!("must be {types}"),
    }
}

fn constraint_error(allowed: &Allowed, value: &Value) -> Option<String> {
    match (allowed, value) {
        (Allowed::Number(Some(rule)), Value::Number(n)) => {
            let n = n.as_f64().unwrap_or_default();
            match rule {
                NumberRule::NonNegative if n < 0.0 => {
                    Some("must be an integer greater than or equal to 0".to_string())
                }
                NumberRule::Positive if n <= 0.0 || n.fract() != 0.0 => {
                    Some("must be an integer greater than 0".to_string())
                }
                _ => None,
            }
        }
        (Allowed::String(Some(options)), Value::String(s)) if !options.contains(&s.as_str()) => {
            Some(format!("must be one of [{}]", options.join(", ")))
        }
        (Allowed::Object { single_key, one_of }, Value::Object(object)) => {
            if *single_key && object.len() != 1 {
                return Some("must have exactly one key".to_string());
            }
            match (one_of, object.keys().next()) {
                (Some(options), Some(key)) if !options.contains(&key.as_str()) => {
                    Some(format!("must be one of [{}]", options.join(", ")))
                }
                _ => None,
            }
        }
        _ => None,
    }
}
