//! Renders HuggingFace-style chat templates, which are ordinary Jinja
//! templates driven by a `messages` list plus tokenizer variables.

use ginja::{to_value, Environment, Value};
use serde_json::json;

const TINYLLAMA_TEMPLATE: &str = "\
{% for message in messages %}
{% if message['role'] == 'user' %}
{{ '<|user|>\\n' + message['content'] + eos_token }}
{% elif message['role'] == 'system' %}
{{ '<|system|>\\n' + message['content'] + eos_token }}
{% elif message['role'] == 'assistant' %}
{{ '<|assistant|>\\n' + message['content'] + eos_token }}
{% endif %}
{% if loop.last and add_generation_prompt %}
{{ '<|assistant|>' }}
{% endif %}
{% endfor %}";

fn chat_env() -> Environment {
    // chat templates assume the newline after a block tag is dropped
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env
}

fn chat_data(messages: serde_json::Value, eos_token: &str, add_generation_prompt: bool) -> Value {
    to_value(json!({
        "messages": messages,
        "eos_token": eos_token,
        "add_generation_prompt": add_generation_prompt,
    }))
    .unwrap()
}

#[test]
fn tinyllama_template_full_features() {
    let data = chat_data(
        json!([
            { "role": "system", "content": "You are a friendly AI." },
            { "role": "user", "content": "Hello!" },
        ]),
        "</s>",
        true,
    );
    let rendered = chat_env().render_str(TINYLLAMA_TEMPLATE, &data).unwrap();
    assert_eq!(
        rendered.trim(),
        "<|system|>\nYou are a friendly AI.</s>\n<|user|>\nHello!</s>\n<|assistant|>"
    );
}

#[test]
fn generation_prompt_respects_flag() {
    let data = chat_data(
        json!([{ "role": "user", "content": "Hi" }]),
        "</s>",
        false,
    );
    let rendered = chat_env().render_str(TINYLLAMA_TEMPLATE, &data).unwrap();
    assert!(rendered.contains("<|user|>"));
    assert!(
        !rendered.contains("<|assistant|>"),
        "no generation prompt when the flag is off"
    );
}

#[test]
fn custom_eos_token() {
    let data = chat_data(
        json!([{ "role": "user", "content": "Hello" }]),
        "<|endoftext|>",
        false,
    );
    let rendered = chat_env().render_str(TINYLLAMA_TEMPLATE, &data).unwrap();
    assert!(rendered.contains("Hello<|endoftext|>"));
}

#[test]
fn multi_turn_conversation() {
    let data = chat_data(
        json!([
            { "role": "system", "content": "You help." },
            { "role": "user", "content": "What is 2+2?" },
            { "role": "assistant", "content": "4" },
            { "role": "user", "content": "Thanks!" },
        ]),
        "</s>",
        true,
    );
    let rendered = chat_env().render_str(TINYLLAMA_TEMPLATE, &data).unwrap();
    assert!(rendered.contains("<|system|>\nYou help.</s>"));
    assert!(rendered.contains("<|user|>\nWhat is 2+2?</s>"));
    assert!(rendered.contains("<|assistant|>\n4</s>"));
    assert!(rendered.contains("<|user|>\nThanks!</s>"));
    assert!(rendered.trim().ends_with("<|assistant|>"));
}

#[test]
fn empty_messages_produce_empty_output() {
    let data = chat_data(json!([]), "</s>", false);
    let rendered = chat_env()
        .render_str(
            "{% for message in messages %}{{ message.content }}{% endfor %}",
            &data,
        )
        .unwrap();
    assert_eq!(rendered, "");
}

#[test]
fn dot_and_bracket_access_are_equivalent() {
    let data = chat_data(json!([{ "role": "user", "content": "hi" }]), "</s>", false);
    let env = chat_env();
    let dot = env
        .render_str(
            "{% for message in messages %}{{ message.role }}{% endfor %}",
            &data,
        )
        .unwrap();
    let bracket = env
        .render_str(
            "{% for message in messages %}{{ message['role'] }}{% endfor %}",
            &data,
        )
        .unwrap();
    assert_eq!(dot, bracket);
    assert_eq!(dot, "user");
}

#[test]
fn loop_first_and_last_bracket_the_conversation() {
    let data = chat_data(
        json!([
            { "role": "a", "content": "" },
            { "role": "b", "content": "" },
            { "role": "c", "content": "" },
        ]),
        "</s>",
        false,
    );
    let rendered = chat_env()
        .render_str(
            "{% for message in messages %}{% if loop.first %}[{% endif %}{{ message.role }}\
             {% if loop.last %}]{% endif %}{% endfor %}",
            &data,
        )
        .unwrap();
    assert_eq!(rendered, "[abc]");
}

#[test]
fn special_characters_pass_through_untouched() {
    let data = chat_data(
        json!([{ "role": "user", "content": "Hello <world> & \"friends\" こんにちは 🌍" }]),
        "</s>",
        false,
    );
    let rendered = chat_env()
        .render_str(
            "{% for message in messages %}{{ message.content }}{% endfor %}",
            &data,
        )
        .unwrap();
    assert_eq!(rendered, "Hello <world> & \"friends\" こんにちは 🌍");
}
