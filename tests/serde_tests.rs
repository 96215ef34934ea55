#[cfg(feature = "serde")]
mod serde_tests {
    use jinjate::{Context, Environment, ErrorKind, UndefinedBehavior, Value};

    #[test]
    #[ntest::timeout(100)]
    fn test_context_serialization() {
        let mut context = Context::new();
        context.insert("name", "Bob");
        context.insert("count", 3);
        context.insert("tags", vec!["a", "b"]);

        let serialized = serde_json::to_string(&context).unwrap();
        assert_eq!(serialized, r#"{"name":"Bob","count":3,"tags":["a","b"]}"#);

        let deserialized: Context = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, context);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_json_context_renders() {
        let context: Context = serde_json::from_str(
            r#"{"user": {"name": "Ada", "admin": true}, "items": [1, 2.5, null]}"#,
        )
        .unwrap();
        let env = Environment::new();
        let rendered = env
            .from_string("{{ user.name }} {{ user.admin }} {% for i in items %}{{ i }},{% endfor %}")
            .unwrap()
            .render(&context)
            .unwrap();
        assert_eq!(rendered, "Ada True 1,2.5,None,");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_value_serialization() {
        let value = Value::from_map([("k", Value::from(vec![Value::from(1), Value::from(false), Value::from(())]))]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"k":[1,false,null]}"#);

        let safe = Value::from_safe_string("<b>".to_string());
        assert_eq!(serde_json::to_string(&safe).unwrap(), r#""<b>""#);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_serialization() {
        let env = Environment::new();
        let err = env.from_string("{% if %}").unwrap_err();
        let serialized = serde_json::to_string(&err).unwrap();
        let deserialized: jinjate::Error = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, err);
        assert_eq!(deserialized.kind(), ErrorKind::TemplateSyntax);

        let behavior: UndefinedBehavior = serde_json::from_str(r#""Strict""#).unwrap();
        assert_eq!(behavior, UndefinedBehavior::Strict);
    }
}
