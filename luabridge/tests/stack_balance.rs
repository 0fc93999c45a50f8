use anyhow::Result;
use luabridge::error::parse_location;
use luabridge::{Bindings, Object, ScriptContext, ScriptEngine, TableList, TableMap, TableRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEED: u64 = 0x5eed_1ab1e;

/// Runs one randomly chosen operation; errors are expected and ignored.
fn random_op(rng: &mut StdRng, engine: &ScriptEngine, map: &TableMap<Object>, list: &TableList) {
    let globals = Bindings::globals(engine.runtime());
    let key = Object::from(format!("k{}", rng.gen_range(0..8)));
    match rng.gen_range(0..16) {
        0 => drop(map.put(key, rng.gen_range(0..100) as f64)),
        1 => drop(map.get(key)),
        2 => drop(map.remove(key)),
        3 => drop(map.get(Object::Nil)),
        4 => drop(map.entries().take(2).count()),
        5 => drop(map.snapshot()),
        6 => drop(list.push(rng.gen_range(0..10) as f64)),
        7 => drop(list.insert(rng.gen_range(0..4), "x")),
        8 => drop(list.remove(rng.gen_range(0..4))),
        9 => drop(list.get(99)),
        10 => drop(engine.eval("return return")),
        11 => drop(engine.eval("error('fails')")),
        12 => drop(engine.eval("local t = {} for i = 1, 5 do t[i] = i end return #t")),
        13 => drop(engine.invoke_function("missing", vec![])),
        14 => drop(engine.invoke_method(&Object::Nil, "m", vec![])),
        _ => drop(globals.len()),
    }
}

#[test]
fn operations_leave_the_stack_balanced() -> Result<()> {
    let engine = ScriptEngine::new();
    let ctx = ScriptContext::new();
    let runtime = engine.runtime().clone();
    runtime.enter(|state| {
        state.push_string("sentinel");
        state.push_number(7.0);
    });

    let map = TableMap::new(&TableRef::create(&runtime));
    let list = TableList::new(&TableRef::create(&runtime));
    let mut rng = StdRng::seed_from_u64(SEED);
    for _ in 0..500 {
        random_op(&mut rng, &engine, &map, &list);
        assert_eq!(runtime.enter(|s| s.get_top()), 2);
    }
    engine.eval_with("return 1", &ctx)?;

    runtime.enter(|state| -> Result<()> {
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_value(1)?.as_str(), Some("sentinel"));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn list_stays_gap_free_under_random_edits() -> Result<()> {
    let runtime = luabridge::Runtime::new();
    let list = TableList::new(&TableRef::create(&runtime));
    let mut model: Vec<f64> = Vec::new();
    let mut rng = StdRng::seed_from_u64(SEED);
    for step in 0..300 {
        let v = step as f64;
        match rng.gen_range(0..3) {
            0 => {
                let i = rng.gen_range(0..=model.len());
                list.insert(i, v)?;
                model.insert(i, v);
            }
            1 if !model.is_empty() => {
                let i = rng.gen_range(0..model.len());
                assert_eq!(list.remove(i)?, Object::Number(model.remove(i)));
            }
            _ => {
                list.push(v)?;
                model.push(v);
            }
        }
        assert_eq!(list.len()?, model.len());
    }
    let values: Vec<f64> = list.to_vec()?.iter().filter_map(Object::as_f64).collect();
    assert_eq!(values, model);
    Ok(())
}

fn random_text(rng: &mut StdRng, alphabet: &[char], max: usize) -> String {
    let len = rng.gen_range(0..max);
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

#[test]
fn malformed_messages_never_mislocate() {
    let mut rng = StdRng::seed_from_u64(SEED);
    let alphabet = ['a', 'b', ':', '1', '9', '0', ' ', '\n', '[', '"', '-'];
    for _ in 0..2000 {
        let message = random_text(&mut rng, &alphabet, 24);
        if let Some((name, line)) = parse_location(&message) {
            // the reported location is a literal prefix of the message
            assert!(!name.is_empty(), "{message:?}");
            let rest = &message[name.len()..];
            assert!(message.starts_with(&name) && rest.starts_with(':'), "{message:?}");
            let digits: String = rest[1..].chars().take_while(char::is_ascii_digit).collect();
            assert_eq!(digits.parse::<u32>().ok(), Some(line), "{message:?}");
            assert!(rest[1 + digits.len()..].starts_with(':'), "{message:?}");
        }
    }
}

#[test]
fn well_formed_messages_are_located() {
    let mut rng = StdRng::seed_from_u64(SEED);
    let name_chars = ['a', 'z', '.', '_', '/', '[', ']', '"', ' '];
    for _ in 0..500 {
        let mut name = random_text(&mut rng, &name_chars, 12);
        name.insert(0, 'n');
        let line: u32 = rng.gen();
        let message = format!("{name}:{line}: {}", random_text(&mut rng, &['x', ':', '1'], 10));
        assert_eq!(parse_location(&message), Some((name, line)), "{message:?}");
    }
}
